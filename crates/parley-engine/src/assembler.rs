use parley_core::turn::{Turn, TurnEvent};

/// What applying one event changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblyOutcome {
    /// The trailing assistant turn was modified.
    TurnUpdated,
    Title(String),
    Language(String),
    TokenInfo { total_tokens: u64, trimmed_tokens: u64 },
}

/// Folds a stream of engine events into the trailing assistant turn.
#[derive(Clone, Debug)]
pub struct ResponseAssembler {
    incremental: bool,
    model_key: Option<String>,
}

impl ResponseAssembler {
    pub fn new(incremental: bool, model_key: Option<String>) -> Self {
        Self { incremental, model_key }
    }

    pub fn apply(&self, history: &mut Vec<Turn>, event: TurnEvent) -> AssemblyOutcome {
        let turn = self.trailing_assistant(history);
        match event {
            TurnEvent::ConversationTitle { title } => AssemblyOutcome::Title(title),
            TurnEvent::SelectedLanguage { language } => AssemblyOutcome::Language(language),
            TurnEvent::ContentReceipt {
                total_tokens,
                trimmed_tokens,
            } => AssemblyOutcome::TokenInfo {
                total_tokens,
                trimmed_tokens,
            },
            TurnEvent::Completion { completion } => {
                self.merge_completion(turn, completion);
                AssemblyOutcome::TurnUpdated
            }
            other => {
                turn.events.push(other);
                AssemblyOutcome::TurnUpdated
            }
        }
    }

    fn trailing_assistant<'a>(&self, history: &'a mut Vec<Turn>) -> &'a mut Turn {
        let needs_turn = !matches!(history.last(), Some(t) if t.is_assistant());
        if needs_turn {
            let mut turn = Turn::assistant();
            turn.model_key = self.model_key.clone();
            history.push(turn);
        }
        let last = history.len() - 1;
        &mut history[last]
    }

    /// Consecutive completions collapse into one event. Deltas are appended;
    /// full-text engines replace. Leading whitespace is trimmed from the
    /// first chunk, and from every chunk of a full-text engine.
    fn merge_completion(&self, turn: &mut Turn, completion: String) {
        let continues = matches!(turn.events.last(), Some(TurnEvent::Completion { .. }));
        let mut text = completion;
        if continues {
            if let Some(TurnEvent::Completion { completion: previous }) = turn.events.pop() {
                if self.incremental {
                    text = previous + &text;
                }
            }
        }
        if !self.incremental || !continues {
            text = text.trim_start().to_string();
        }
        turn.text = text.clone();
        turn.events.push(TurnEvent::Completion { completion: text });
    }
}
