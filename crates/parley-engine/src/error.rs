use parley_core::errors::ApiError;

/// Why a session refused an operation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a turn is already queued")]
    QueueFull,

    #[error("conversation has an unresolved error")]
    Erroring,

    #[error("only human turns can be submitted")]
    NotHuman,

    #[error("a request is already in progress")]
    RequestInProgress,

    #[error("turn index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("no human turn to retry")]
    NothingToRetry,

    #[error("no queued turn")]
    NothingQueued,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("suggestion not found: {0}")]
    SuggestionNotFound(String),

    #[error("suggestions already generated")]
    SuggestionsAlreadyGenerated,

    #[error("user has not opted in")]
    NotOptedIn,

    #[error("no content associated")]
    NoContent,

    #[error("engine error: {0}")]
    Api(#[from] ApiError),
}
