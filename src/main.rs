//! Inspect and prune the stored conversation history.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use parley_core::conversation::Conversation;
use parley_core::ids::ConversationId;
use parley_service::settings::{load_settings, load_settings_from_path};
use parley_store::{ConversationRepo, ConversationStore, Database};

#[derive(Debug, Parser)]
#[command(name = "parley", about = "Conversation history maintenance")]
struct Args {
    /// Settings file; defaults to `$PARLEY_SETTINGS` or `~/.parley/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file, overriding settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List conversations, most recently updated first.
    List,
    /// Show one conversation's entries and associated content.
    Show { id: String },
    /// Delete one conversation.
    Delete { id: String },
    /// Delete every conversation.
    Purge {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    parley_telemetry::init_telemetry(&settings.telemetry_config()?)?;

    let db_path = args.db.clone().unwrap_or_else(|| settings.database_path());
    let db = Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    tracing::debug!(path = %db_path.display(), "database opened");
    let store = ConversationRepo::new(db);

    match args.command {
        Command::List => list(&store, args.json),
        Command::Show { id } => show(&store, &ConversationId::from_raw(id), args.json),
        Command::Delete { id } => {
            let id = ConversationId::from_raw(id);
            if !store.delete_conversation(&id)? {
                bail!("no conversation {id}");
            }
            println!("deleted {id}");
            Ok(())
        }
        Command::Purge { yes } => {
            if !yes {
                bail!("refusing to delete all conversations without --yes");
            }
            let deleted = store.delete_all()?;
            tracing::info!(deleted, "history purged");
            println!("deleted {deleted} conversations");
            Ok(())
        }
    }
}

fn list(store: &ConversationRepo, json: bool) -> Result<()> {
    let conversations = store.list_conversations()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
        return Ok(());
    }
    for conversation in &conversations {
        println!("{}", summary_line(conversation));
    }
    Ok(())
}

fn summary_line(conversation: &Conversation) -> String {
    let title = if conversation.title.is_empty() {
        "(untitled)"
    } else {
        conversation.title.as_str()
    };
    format!(
        "{}  {}  {}  {} tokens",
        conversation.uuid,
        conversation.updated_time.format("%Y-%m-%d %H:%M"),
        title,
        conversation.total_tokens
    )
}

fn show(store: &ConversationRepo, id: &ConversationId, json: bool) -> Result<()> {
    let conversation = store.get_conversation(id)?;
    let archive = store.load_archive(id)?;
    if json {
        let value = serde_json::json!({
            "conversation": conversation,
            "entries": archive.entries,
            "associatedContent": archive.associated_content,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", summary_line(&conversation));
    if let Some(model) = &conversation.model_key {
        println!("model: {model}");
    }
    for content in &archive.associated_content {
        println!("content: {} ({}%) {}", content.title, content.used_percentage, content.url);
    }
    for turn in &archive.entries {
        let who = if turn.is_human() { "human" } else { "assistant" };
        let text = if turn.is_human() { turn.text.as_str() } else { turn.completion_text() };
        println!("\n[{who}] {text}");
        if !turn.edits.is_empty() {
            println!("  ({} edits)", turn.edits.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn parses_subcommands() {
        let args = Args::parse_from(["parley", "--json", "show", "conv_1"]);
        assert!(args.json);
        assert!(matches!(args.command, Command::Show { ref id } if id == "conv_1"));

        let args = Args::parse_from(["parley", "purge", "--yes"]);
        assert!(matches!(args.command, Command::Purge { yes: true }));
    }

    #[test]
    fn summary_line_marks_untitled() {
        let mut conversation = Conversation::new(ConversationId::from_raw("conv_x"), false);
        conversation.updated_time = Utc::now();
        assert!(summary_line(&conversation).contains("(untitled)"));
        conversation.title = "Recipes".into();
        assert!(summary_line(&conversation).contains("Recipes"));
    }
}
