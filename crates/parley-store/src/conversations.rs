use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use parley_core::conversation::{ArchivedContentText, ContentRef, Conversation, ConversationArchive};
use parley_core::ids::{ContentId, ContentRefId, ConversationId, TurnId};
use parley_core::turn::{Turn, TurnEvent};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_time, get, get_opt, parse_enum, parse_json, parse_time};

/// Persistence collaborator for conversations.
///
/// Entries are written incrementally as a session commits them; the
/// archive is read back in full when a conversation is loaded.
pub trait ConversationStore: Send + Sync {
    /// All conversations, most recently updated first.
    fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError>;
    fn load_archive(&self, id: &ConversationId) -> Result<ConversationArchive, StoreError>;

    /// Create the conversation row together with its first entry.
    fn add_conversation(&self, conversation: &Conversation, first_entry: &Turn) -> Result<(), StoreError>;
    fn add_entry(&self, id: &ConversationId, turn: &Turn) -> Result<(), StoreError>;
    fn update_entry(&self, id: &ConversationId, turn: &Turn) -> Result<(), StoreError>;
    fn delete_entry(&self, id: &ConversationId, turn_uuid: &TurnId) -> Result<(), StoreError>;

    fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError>;
    fn update_model(&self, id: &ConversationId, model_key: &str) -> Result<(), StoreError>;
    fn update_tokens(&self, id: &ConversationId, total_tokens: u64, trimmed_tokens: u64) -> Result<(), StoreError>;

    /// Replace the associated content list. Text is only overwritten for
    /// entries that have a non-empty archived text in `texts`.
    fn upsert_associated_content(
        &self,
        id: &ConversationId,
        content: &[ContentRef],
        texts: &[ArchivedContentText],
    ) -> Result<(), StoreError>;

    fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError>;
    fn delete_all(&self) -> Result<usize, StoreError>;
}

/// SQLite implementation of [`ConversationStore`].
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

const CONVERSATION_COLUMNS: &str =
    "uuid, title, model_key, total_tokens, trimmed_tokens, created_at, updated_at";
const ENTRY_COLUMNS: &str =
    "uuid, character_type, action_type, text, prompt, selected_text, events, edits, model_key, created_at";
const CONTENT_COLUMNS: &str =
    "uuid, content_id, url, title, content_type, used_percentage, turn_uuid, content_text";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, StoreError> {
    let uuid: String = get(row, 0, "conversation", "uuid")?;
    let created: String = get(row, 5, "conversation", "created_at")?;
    let updated: String = get(row, 6, "conversation", "updated_at")?;
    let total: i64 = get(row, 3, "conversation", "total_tokens")?;
    let trimmed: i64 = get(row, 4, "conversation", "trimmed_tokens")?;
    Ok(Conversation {
        uuid: ConversationId::from_raw(uuid),
        title: get(row, 1, "conversation", "title")?,
        created_time: parse_time(&created, "conversation", "created_at")?,
        updated_time: parse_time(&updated, "conversation", "updated_at")?,
        is_temporary: false,
        model_key: get_opt(row, 2, "conversation", "model_key")?,
        total_tokens: u64::try_from(total).unwrap_or_default(),
        trimmed_tokens: u64::try_from(trimmed).unwrap_or_default(),
        has_content: false,
        associated_content: Vec::new(),
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<Turn, StoreError> {
    const T: &str = "conversation_entry";
    let uuid: String = get(row, 0, T, "uuid")?;
    let character: String = get(row, 1, T, "character_type")?;
    let action: String = get(row, 2, T, "action_type")?;
    let events: String = get(row, 6, T, "events")?;
    let edits: String = get(row, 7, T, "edits")?;
    let created: String = get(row, 9, T, "created_at")?;
    Ok(Turn {
        uuid: TurnId::from_raw(uuid),
        character: parse_enum(&character, T, "character_type")?,
        action_type: parse_enum(&action, T, "action_type")?,
        text: get(row, 3, T, "text")?,
        prompt: get_opt(row, 4, T, "prompt")?,
        selected_text: get_opt(row, 5, T, "selected_text")?,
        events: parse_json::<Vec<TurnEvent>>(&events, T, "events")?,
        created_time: parse_time(&created, T, "created_at")?,
        edits: parse_json::<Vec<Turn>>(&edits, T, "edits")?,
        is_staged: false,
        model_key: get_opt(row, 8, T, "model_key")?,
    })
}

fn row_to_content(row: &rusqlite::Row<'_>) -> Result<(ContentRef, String), StoreError> {
    const T: &str = "associated_content";
    let uuid: String = get(row, 0, T, "uuid")?;
    let content_type: String = get(row, 4, T, "content_type")?;
    let used: i64 = get(row, 5, T, "used_percentage")?;
    let turn_uuid: Option<String> = get_opt(row, 6, T, "turn_uuid")?;
    let content = ContentRef {
        uuid: ContentRefId::from_raw(uuid),
        content_id: ContentId(get(row, 1, T, "content_id")?),
        url: get(row, 2, T, "url")?,
        title: get(row, 3, T, "title")?,
        content_type: parse_enum(&content_type, T, "content_type")?,
        used_percentage: u8::try_from(used.clamp(0, 100)).unwrap_or(100),
        turn_uuid: turn_uuid.map(TurnId::from_raw),
    };
    Ok((content, get(row, 7, T, "content_text")?))
}

fn load_content(conn: &Connection, id: &ConversationId) -> Result<Vec<(ContentRef, String)>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTENT_COLUMNS} FROM associated_content WHERE conversation_uuid = ?1 ORDER BY position"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_content(row)?);
    }
    Ok(results)
}

fn touch(conn: &Connection, id: &ConversationId) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE conversation SET updated_at = ?1 WHERE uuid = ?2",
        params![format_time(&Utc::now()), id.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("conversation {id}")));
    }
    Ok(())
}

fn insert_entry(conn: &Connection, id: &ConversationId, turn: &Turn) -> Result<(), StoreError> {
    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM conversation_entry WHERE conversation_uuid = ?1",
        [id.as_str()],
        |row| row.get(0),
    )?;
    conn.execute(
        &format!(
            "INSERT INTO conversation_entry (conversation_uuid, position, {ENTRY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            id.as_str(),
            position,
            turn.uuid.as_str(),
            turn.character.to_string(),
            turn.action_type.to_string(),
            turn.text,
            turn.prompt,
            turn.selected_text,
            serde_json::to_string(&turn.events)?,
            serde_json::to_string(&turn.edits)?,
            turn.model_key,
            format_time(&turn.created_time),
        ],
    )?;
    Ok(())
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl ConversationStore for ConversationRepo {
    #[instrument(skip(self))]
    fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversation ORDER BY updated_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut conversations = Vec::new();
            while let Some(row) = rows.next()? {
                conversations.push(row_to_conversation(row)?);
            }
            drop(rows);
            for conversation in &mut conversations {
                conversation.associated_content = load_content(conn, &conversation.uuid)?
                    .into_iter()
                    .map(|(c, _)| c)
                    .collect();
                conversation.has_content = !conversation.associated_content.is_empty();
            }
            Ok(conversations)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn get_conversation(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.db.with_conn(|conn| {
            let mut conversation = conn
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversation WHERE uuid = ?1"),
                    [id.as_str()],
                    |row| Ok(row_to_conversation(row)),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))??;
            conversation.associated_content = load_content(conn, id)?.into_iter().map(|(c, _)| c).collect();
            conversation.has_content = !conversation.associated_content.is_empty();
            Ok(conversation)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn load_archive(&self, id: &ConversationId) -> Result<ConversationArchive, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM conversation_entry WHERE conversation_uuid = ?1 ORDER BY position"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_turn(row)?);
            }
            drop(rows);

            let mut archive = ConversationArchive {
                entries,
                ..Default::default()
            };
            for (content, text) in load_content(conn, id)? {
                if !text.is_empty() {
                    archive.content_text.push(ArchivedContentText {
                        content_uuid: content.uuid.clone(),
                        text,
                    });
                }
                archive.associated_content.push(content);
            }
            debug!(entries = archive.entries.len(), "archive loaded");
            Ok(archive)
        })
    }

    #[instrument(skip(self, conversation, first_entry), fields(conversation_id = %conversation.uuid))]
    fn add_conversation(&self, conversation: &Conversation, first_entry: &Turn) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO conversation ({CONVERSATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    conversation.uuid.as_str(),
                    conversation.title,
                    conversation.model_key,
                    to_sql_count(conversation.total_tokens),
                    to_sql_count(conversation.trimmed_tokens),
                    format_time(&conversation.created_time),
                    format_time(&Utc::now()),
                ],
            )?;
            insert_entry(&tx, &conversation.uuid, first_entry)?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self, turn), fields(conversation_id = %id, turn_uuid = %turn.uuid))]
    fn add_entry(&self, id: &ConversationId, turn: &Turn) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            touch(&tx, id)?;
            insert_entry(&tx, id, turn)?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self, turn), fields(conversation_id = %id, turn_uuid = %turn.uuid))]
    fn update_entry(&self, id: &ConversationId, turn: &Turn) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE conversation_entry
                 SET text = ?1, prompt = ?2, selected_text = ?3, events = ?4, edits = ?5, model_key = ?6
                 WHERE uuid = ?7 AND conversation_uuid = ?8",
                params![
                    turn.text,
                    turn.prompt,
                    turn.selected_text,
                    serde_json::to_string(&turn.events)?,
                    serde_json::to_string(&turn.edits)?,
                    turn.model_key,
                    turn.uuid.as_str(),
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("entry {}", turn.uuid)));
            }
            touch(&tx, id)?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn delete_entry(&self, id: &ConversationId, turn_uuid: &TurnId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversation_entry WHERE uuid = ?1 AND conversation_uuid = ?2",
                params![turn_uuid.as_str(), id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation SET title = ?1 WHERE uuid = ?2",
                params![title, id.as_str()],
            )?;
            touch(conn, id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn update_model(&self, id: &ConversationId, model_key: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversation SET model_key = ?1 WHERE uuid = ?2",
                params![model_key, id.as_str()],
            )?;
            touch(conn, id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn update_tokens(&self, id: &ConversationId, total_tokens: u64, trimmed_tokens: u64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation SET total_tokens = ?1, trimmed_tokens = ?2 WHERE uuid = ?3",
                params![to_sql_count(total_tokens), to_sql_count(trimmed_tokens), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self, content, texts), fields(conversation_id = %id, count = content.len()))]
    fn upsert_associated_content(
        &self,
        id: &ConversationId,
        content: &[ContentRef],
        texts: &[ArchivedContentText],
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let keep: Vec<&str> = content.iter().map(|c| c.uuid.as_str()).collect();
            {
                let mut existing = tx.prepare("SELECT uuid FROM associated_content WHERE conversation_uuid = ?1")?;
                let stale: Vec<String> = existing
                    .query_map([id.as_str()], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .filter(|uuid| !keep.contains(&uuid.as_str()))
                    .collect();
                for uuid in stale {
                    tx.execute("DELETE FROM associated_content WHERE uuid = ?1", [uuid])?;
                }
            }
            for (position, item) in content.iter().enumerate() {
                let text = texts
                    .iter()
                    .find(|t| t.content_uuid == item.uuid)
                    .map(|t| t.text.as_str())
                    .unwrap_or_default();
                tx.execute(
                    "INSERT INTO associated_content
                        (uuid, conversation_uuid, position, content_id, url, title, content_type,
                         used_percentage, turn_uuid, content_text)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(uuid) DO UPDATE SET
                        position = excluded.position,
                        url = excluded.url,
                        title = excluded.title,
                        content_type = excluded.content_type,
                        used_percentage = excluded.used_percentage,
                        turn_uuid = excluded.turn_uuid,
                        content_text = CASE WHEN excluded.content_text = ''
                            THEN associated_content.content_text
                            ELSE excluded.content_text END",
                    params![
                        item.uuid.as_str(),
                        id.as_str(),
                        i64::try_from(position).unwrap_or(i64::MAX),
                        item.content_id.0,
                        item.url,
                        item.title,
                        item.content_type.to_string(),
                        i64::from(item.used_percentage),
                        item.turn_uuid.as_ref().map(|t| t.as_str()),
                        text,
                    ],
                )?;
            }
            touch(&tx, id)?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM conversation WHERE uuid = ?1", [id.as_str()])?;
            Ok(removed > 0)
        })
    }

    #[instrument(skip(self))]
    fn delete_all(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM conversation", [])?;
            Ok(removed)
        })
    }
}

/// Conversations whose last update falls in `[begin, end)`.
pub fn updated_between(
    conversations: &[Conversation],
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<ConversationId> {
    conversations
        .iter()
        .filter(|c| c.updated_time >= begin && c.updated_time < end)
        .map(|c| c.uuid.clone())
        .collect()
}
