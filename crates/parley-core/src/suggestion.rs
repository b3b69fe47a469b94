use serde::{Deserialize, Serialize};

use crate::turn::ActionType;

/// Where suggestion generation stands for a conversation.
///
/// Moves `CanGenerate -> IsGenerating -> HasGenerated` and only resets to
/// `None` when content association is dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    #[default]
    None,
    CanGenerate,
    IsGenerating,
    HasGenerated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Text shown to the user.
    pub title: String,
    /// Text sent to the engine, when it differs from the title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub action_type: ActionType,
}

impl Suggestion {
    pub fn query(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: None,
            action_type: ActionType::Query,
        }
    }

    pub fn generated(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: None,
            action_type: ActionType::Suggestion,
        }
    }

    pub fn summarize(is_video: bool) -> Self {
        if is_video {
            Self {
                title: SUMMARIZE_VIDEO_TITLE.into(),
                prompt: Some(SUMMARIZE_VIDEO_PROMPT.into()),
                action_type: ActionType::SummarizeVideo,
            }
        } else {
            Self {
                title: SUMMARIZE_PAGE_TITLE.into(),
                prompt: Some(SUMMARIZE_PAGE_PROMPT.into()),
                action_type: ActionType::SummarizePage,
            }
        }
    }

    /// Text the engine should receive for this suggestion.
    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.title)
    }
}

pub const SUMMARIZE_PAGE_TITLE: &str = "Summarize this page";
pub const SUMMARIZE_PAGE_PROMPT: &str =
    "Summarize the content of this web page in a few bullet points.";
pub const SUMMARIZE_VIDEO_TITLE: &str = "Summarize this video";
pub const SUMMARIZE_VIDEO_PROMPT: &str =
    "Summarize the content of this video transcript in a few bullet points.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_is_video_aware() {
        let page = Suggestion::summarize(false);
        assert_eq!(page.action_type, ActionType::SummarizePage);
        assert_eq!(page.title, SUMMARIZE_PAGE_TITLE);
        let video = Suggestion::summarize(true);
        assert_eq!(video.action_type, ActionType::SummarizeVideo);
        assert_eq!(video.prompt_text(), SUMMARIZE_VIDEO_PROMPT);
    }

    #[test]
    fn prompt_falls_back_to_title() {
        assert_eq!(Suggestion::query("What is this?").prompt_text(), "What is this?");
    }
}
