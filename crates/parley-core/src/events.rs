use serde::{Deserialize, Serialize};

use crate::conversation::{ContentRef, Conversation};
use crate::errors::ApiError;
use crate::ids::{ConversationId, TurnId};
use crate::suggestion::{Suggestion, SuggestionStatus};
use crate::turn::Turn;

/// Notifications published by a conversation session.
///
/// The `Entry*` variants are the incremental persistence feed; everything
/// else is for UI observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    HistoryChanged {
        conversation_id: ConversationId,
        /// Set while a response streams in; `None` for whole-history changes.
        partial_turn: Option<Turn>,
    },
    RequestInProgress {
        conversation_id: ConversationId,
        in_progress: bool,
    },
    ApiError {
        conversation_id: ConversationId,
        error: Option<ApiError>,
    },
    SuggestionsChanged {
        conversation_id: ConversationId,
        suggestions: Vec<Suggestion>,
        status: SuggestionStatus,
    },
    AssociatedContentChanged {
        conversation_id: ConversationId,
        content: Vec<ContentRef>,
        should_send: bool,
    },
    TitleChanged {
        conversation_id: ConversationId,
        title: String,
    },
    TokenInfoChanged {
        conversation_id: ConversationId,
        total_tokens: u64,
        trimmed_tokens: u64,
    },
    ModelChanged {
        conversation_id: ConversationId,
        model_key: String,
    },
    EntryAdded {
        conversation_id: ConversationId,
        turn: Turn,
    },
    EntryUpdated {
        conversation_id: ConversationId,
        turn: Turn,
    },
    EntryRemoved {
        conversation_id: ConversationId,
        turn_uuid: TurnId,
    },
    ClientsChanged {
        conversation_id: ConversationId,
        connected: usize,
    },
}

impl SessionEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::HistoryChanged { conversation_id, .. }
            | Self::RequestInProgress { conversation_id, .. }
            | Self::ApiError { conversation_id, .. }
            | Self::SuggestionsChanged { conversation_id, .. }
            | Self::AssociatedContentChanged { conversation_id, .. }
            | Self::TitleChanged { conversation_id, .. }
            | Self::TokenInfoChanged { conversation_id, .. }
            | Self::ModelChanged { conversation_id, .. }
            | Self::EntryAdded { conversation_id, .. }
            | Self::EntryUpdated { conversation_id, .. }
            | Self::EntryRemoved { conversation_id, .. }
            | Self::ClientsChanged { conversation_id, .. } => conversation_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::HistoryChanged { .. } => "history_changed",
            Self::RequestInProgress { .. } => "request_in_progress",
            Self::ApiError { .. } => "api_error",
            Self::SuggestionsChanged { .. } => "suggestions_changed",
            Self::AssociatedContentChanged { .. } => "associated_content_changed",
            Self::TitleChanged { .. } => "title_changed",
            Self::TokenInfoChanged { .. } => "token_info_changed",
            Self::ModelChanged { .. } => "model_changed",
            Self::EntryAdded { .. } => "entry_added",
            Self::EntryUpdated { .. } => "entry_updated",
            Self::EntryRemoved { .. } => "entry_removed",
            Self::ClientsChanged { .. } => "clients_changed",
        }
    }

    pub fn is_persistence_event(&self) -> bool {
        matches!(
            self,
            Self::EntryAdded { .. } | Self::EntryUpdated { .. } | Self::EntryRemoved { .. }
        )
    }
}

/// Notifications published by the conversation registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// Full list of visible conversations, most recently updated first.
    ConversationListChanged { conversations: Vec<Conversation> },
    ConversationUnloaded { conversation_id: ConversationId },
}
