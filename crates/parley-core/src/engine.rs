use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::content::PageContent;
use crate::errors::ApiError;
use crate::ids::ConversationId;
use crate::turn::{Turn, TurnEvent};

/// Stream of events for one assistant turn. An `Err` item ends the turn as failed.
pub type TurnEventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, ApiError>> + Send>>;

/// Input to a single response generation.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    /// One entry per associated source, in attachment order.
    pub contents: Vec<PageContent>,
    pub history: Vec<Turn>,
    /// Text the engine should answer. Differs from the last turn's text
    /// for summarize actions.
    pub question: String,
    pub selected_language: Option<String>,
}

impl GenerationRequest {
    pub fn is_video(&self) -> bool {
        self.contents.len() == 1 && self.contents[0].is_video
    }
}

/// A backend able to answer conversation turns.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Remove substrings that would break the engine's prompt format.
    fn sanitize(&self, text: &mut String);

    /// Whether completion events carry deltas rather than the full text so far.
    fn supports_incremental_text(&self) -> bool;

    async fn generate_response(&self, request: GenerationRequest) -> Result<TurnEventStream, ApiError>;

    async fn generate_suggestions(
        &self,
        is_video: bool,
        content: &str,
        selected_language: Option<&str>,
    ) -> Result<Vec<String>, ApiError>;

    /// Abort every request this engine has in flight.
    fn clear_all_queries(&self);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub key: String,
    pub display_name: String,
    /// Content budget in characters.
    pub max_content_length: usize,
    /// User-configured endpoint rather than a built-in model.
    pub is_custom: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Resolves model keys to engines.
pub trait ModelCatalog: Send + Sync {
    fn default_model_key(&self) -> String;
    fn models(&self) -> Vec<ModelInfo>;
    fn model(&self, key: &str) -> Option<ModelInfo>;

    /// Build an engine for a model. Fails when a custom model no longer
    /// passes validation.
    fn engine_for(&self, key: &str) -> Result<Arc<dyn GenerationEngine>, ApiError>;
}
