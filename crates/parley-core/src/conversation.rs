use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContentId, ContentRefId, ConversationId, TurnId};
use crate::turn::Turn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Page,
    Video,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page => write!(f, "page"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(Self::Page),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

/// A content source as seen by a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub uuid: ContentRefId,
    pub content_id: ContentId,
    pub url: String,
    pub title: String,
    pub content_type: ContentType,
    /// Share of this source that fit into the model's content budget, 0..=100.
    pub used_percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_uuid: Option<TurnId>,
}

/// Conversation metadata. Lives for as long as the conversation exists,
/// whether or not a session is loaded for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub uuid: ConversationId,
    pub title: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub is_temporary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    pub total_tokens: u64,
    pub trimmed_tokens: u64,
    pub has_content: bool,
    #[serde(default)]
    pub associated_content: Vec<ContentRef>,
}

impl Conversation {
    pub fn new(uuid: ConversationId, is_temporary: bool) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            title: String::new(),
            created_time: now,
            updated_time: now,
            is_temporary,
            model_key: None,
            total_tokens: 0,
            trimmed_tokens: 0,
            has_content: false,
            associated_content: Vec::new(),
        }
    }
}

/// Archived text for one associated content entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedContentText {
    pub content_uuid: ContentRefId,
    pub text: String,
}

/// Everything needed to rehydrate a session from storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationArchive {
    pub entries: Vec<Turn>,
    pub associated_content: Vec<ContentRef>,
    pub content_text: Vec<ArchivedContentText>,
}

impl ConversationArchive {
    pub fn text_for(&self, uuid: &ContentRefId) -> Option<&str> {
        self.content_text
            .iter()
            .find(|c| &c.content_uuid == uuid)
            .map(|c| c.text.as_str())
    }
}
