use parley_core::ids::ConversationId;
use parley_engine::SessionError;
use parley_store::StoreError;

/// Failures of registry operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("content source has not granted permission")]
    PermissionDenied,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type SettingsResult<T> = std::result::Result<T, SettingsError>;
