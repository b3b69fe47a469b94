/// SQL DDL for the conversation store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversation (
    uuid TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    model_key TEXT,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    trimmed_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_entry (
    uuid TEXT PRIMARY KEY,
    conversation_uuid TEXT NOT NULL REFERENCES conversation(uuid) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    character_type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    text TEXT NOT NULL,
    prompt TEXT,
    selected_text TEXT,
    events TEXT NOT NULL DEFAULT '[]',
    edits TEXT NOT NULL DEFAULT '[]',
    model_key TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS associated_content (
    uuid TEXT PRIMARY KEY,
    conversation_uuid TEXT NOT NULL REFERENCES conversation(uuid) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    content_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL,
    used_percentage INTEGER NOT NULL,
    turn_uuid TEXT,
    content_text TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_entry_conversation ON conversation_entry(conversation_uuid, position);
CREATE INDEX IF NOT EXISTS idx_content_conversation ON associated_content(conversation_uuid, position);
CREATE INDEX IF NOT EXISTS idx_conversation_updated ON conversation(updated_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
