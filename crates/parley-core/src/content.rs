use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::ContentError;
use crate::ids::ContentId;

/// Result of one content fetch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub text: String,
    pub is_video: bool,
    /// Opaque marker from the source. A non-empty token equal to the
    /// previous one means the content has not changed.
    pub invalidation_token: String,
}

impl PageContent {
    pub fn new(text: impl Into<String>, is_video: bool) -> Self {
        Self {
            text: text.into(),
            is_video,
            invalidation_token: String::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.invalidation_token = token.into();
        self
    }
}

/// A query/summary pair pre-seeded by a content source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    pub query: String,
    pub summary: String,
}

/// Something that supplies page content to conversations, e.g. a browser tab.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn content_id(&self) -> ContentId;
    fn url(&self) -> String;
    fn title(&self) -> String;

    /// Fetch current content. Implementations may take arbitrarily long;
    /// callers coalesce concurrent fetches.
    async fn fetch_content(&self) -> Result<PageContent, ContentError>;

    /// Text the source already holds, used before any fetch completes.
    fn cached_text(&self) -> String {
        String::new()
    }

    fn cached_is_video(&self) -> bool {
        false
    }

    async fn staged_entries(&self) -> Option<Vec<StagedEntry>> {
        None
    }

    /// Whether the user allowed this source to be opened in a conversation.
    fn has_permission(&self) -> bool {
        true
    }

    /// `None` when screenshots are not supported.
    async fn screenshots(&self) -> Option<Vec<Bytes>> {
        None
    }
}
