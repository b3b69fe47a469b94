use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TurnId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterType {
    Human,
    Assistant,
}

impl std::fmt::Display for CharacterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for CharacterType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown character type: {other}")),
        }
    }
}

/// What a turn asks for. Human turns submitted without one are classified on submit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Unspecified,
    Query,
    Response,
    Suggestion,
    SummarizePage,
    SummarizeVideo,
    SummarizeSelectedText,
    Explain,
    Paraphrase,
    Improve,
    Shorten,
    Expand,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Query => "query",
            Self::Response => "response",
            Self::Suggestion => "suggestion",
            Self::SummarizePage => "summarize_page",
            Self::SummarizeVideo => "summarize_video",
            Self::SummarizeSelectedText => "summarize_selected_text",
            Self::Explain => "explain",
            Self::Paraphrase => "paraphrase",
            Self::Improve => "improve",
            Self::Shorten => "shorten",
            Self::Expand => "expand",
        }
    }

    pub fn is_summarize(&self) -> bool {
        matches!(self, Self::SummarizePage | Self::SummarizeVideo)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Self::Unspecified,
            Self::Query,
            Self::Response,
            Self::Suggestion,
            Self::SummarizePage,
            Self::SummarizeVideo,
            Self::SummarizeSelectedText,
            Self::Explain,
            Self::Paraphrase,
            Self::Improve,
            Self::Shorten,
            Self::Expand,
        ];
        all.into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action type: {s}"))
    }
}

/// Events produced by a generation engine for one assistant turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Completion { completion: String },
    ConversationTitle { title: String },
    SelectedLanguage { language: String },
    ContentReceipt { total_tokens: u64, trimmed_tokens: u64 },
    SearchQueries { queries: Vec<String> },
    SearchStatus { is_searching: bool },
}

impl TurnEvent {
    pub fn completion(text: impl Into<String>) -> Self {
        Self::Completion {
            completion: text.into(),
        }
    }

    /// Title, language and token receipts update the conversation rather
    /// than the turn, so they are never stored in a turn's event list.
    pub fn is_side_channel(&self) -> bool {
        matches!(
            self,
            Self::ConversationTitle { .. } | Self::SelectedLanguage { .. } | Self::ContentReceipt { .. }
        )
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Completion { .. } => "completion",
            Self::ConversationTitle { .. } => "conversation_title",
            Self::SelectedLanguage { .. } => "selected_language",
            Self::ContentReceipt { .. } => "content_receipt",
            Self::SearchQueries { .. } => "search_queries",
            Self::SearchStatus { .. } => "search_status",
        }
    }
}

/// One message of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub uuid: TurnId,
    pub character: CharacterType,
    pub action_type: ActionType,
    /// Mirrors the latest completion for assistant turns.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TurnEvent>,
    pub created_time: DateTime<Utc>,
    /// Version chain of edits, oldest first. The last one is current.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<Turn>,
    #[serde(default)]
    pub is_staged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
}

impl Turn {
    fn new(character: CharacterType, action_type: ActionType, text: String) -> Self {
        Self {
            uuid: TurnId::new(),
            character,
            action_type,
            text,
            prompt: None,
            selected_text: None,
            events: Vec::new(),
            created_time: Utc::now(),
            edits: Vec::new(),
            is_staged: false,
            model_key: None,
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(CharacterType::Human, ActionType::Unspecified, text.into())
    }

    pub fn human_with_action(text: impl Into<String>, action_type: ActionType) -> Self {
        Self::new(CharacterType::Human, action_type, text.into())
    }

    /// Empty assistant turn awaiting completion events.
    pub fn assistant() -> Self {
        Self::new(CharacterType::Assistant, ActionType::Response, String::new())
    }

    /// Assistant turn with a single completion, as restored from storage or staging.
    pub fn assistant_with_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut turn = Self::new(CharacterType::Assistant, ActionType::Response, text.clone());
        turn.events.push(TurnEvent::completion(text));
        turn
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_selected_text(mut self, selected: impl Into<String>) -> Self {
        self.selected_text = Some(selected.into());
        self
    }

    pub fn staged(mut self) -> Self {
        self.is_staged = true;
        self
    }

    pub fn is_human(&self) -> bool {
        self.character == CharacterType::Human
    }

    pub fn is_assistant(&self) -> bool {
        self.character == CharacterType::Assistant
    }

    /// Current version of this turn, following the edit chain.
    pub fn latest(&self) -> &Turn {
        self.edits.last().unwrap_or(self)
    }

    pub fn latest_mut(&mut self) -> &mut Turn {
        if self.edits.is_empty() {
            self
        } else {
            let last = self.edits.len() - 1;
            &mut self.edits[last]
        }
    }

    /// Text of the latest completion event, or empty.
    pub fn completion_text(&self) -> &str {
        self.events
            .iter()
            .rev()
            .find_map(|e| match e {
                TurnEvent::Completion { completion } => Some(completion.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    pub fn has_completion(&self) -> bool {
        !self.completion_text().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_defaults() {
        let turn = Turn::human("Hi");
        assert!(turn.is_human());
        assert_eq!(turn.action_type, ActionType::Unspecified);
        assert!(turn.events.is_empty());
        assert!(!turn.is_staged);
    }

    #[test]
    fn latest_follows_edit_chain() {
        let mut turn = Turn::human("first");
        assert_eq!(turn.latest().text, "first");
        turn.edits.push(Turn::human("second"));
        turn.edits.push(Turn::human("third"));
        assert_eq!(turn.latest().text, "third");
        turn.latest_mut().text = "fourth".into();
        assert_eq!(turn.edits[1].text, "fourth");
    }

    #[test]
    fn completion_text_uses_last_completion() {
        let mut turn = Turn::assistant();
        assert_eq!(turn.completion_text(), "");
        turn.events.push(TurnEvent::completion("one"));
        turn.events.push(TurnEvent::SearchStatus { is_searching: false });
        turn.events.push(TurnEvent::completion("two"));
        assert_eq!(turn.completion_text(), "two");
        assert!(turn.has_completion());
    }

    #[test]
    fn side_channel_classification() {
        assert!(TurnEvent::ConversationTitle { title: "t".into() }.is_side_channel());
        assert!(TurnEvent::SelectedLanguage { language: "fr".into() }.is_side_channel());
        assert!(TurnEvent::ContentReceipt { total_tokens: 1, trimmed_tokens: 0 }.is_side_channel());
        assert!(!TurnEvent::completion("x").is_side_channel());
        assert!(!TurnEvent::SearchQueries { queries: vec![] }.is_side_channel());
    }

    #[test]
    fn action_type_parse_roundtrip() {
        for name in ["query", "summarize_video", "suggestion", "response"] {
            let parsed: ActionType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("nonsense".parse::<ActionType>().is_err());
    }

    #[test]
    fn turn_event_serde_tag() {
        let json = serde_json::to_value(TurnEvent::completion("hello")).unwrap();
        assert_eq!(json["type"], "completion");
        assert_eq!(json["completion"], "hello");
    }

    #[test]
    fn empty_collections_skipped_in_json() {
        let json = serde_json::to_value(Turn::human("x")).unwrap();
        assert!(json.get("events").is_none());
        assert!(json.get("edits").is_none());
        let back: Turn = serde_json::from_value(json).unwrap();
        assert!(back.edits.is_empty());
    }
}
