use serde::{Deserialize, Serialize};

/// User-visible failure of a generation request. Held as the session's
/// `current_error`; `None` there means no error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiError {
    #[error("connection issue")]
    ConnectionIssue,
    #[error("rate limit reached")]
    RateLimitReached,
    #[error("invalid endpoint url")]
    InvalidEndpointUrl,
    #[error("context limit reached")]
    ContextLimitReached,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("service overloaded")]
    ServiceOverloaded,
    #[error("engine error: {message}")]
    Engine { message: String },
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionIssue | Self::RateLimitReached | Self::ServiceOverloaded | Self::Engine { .. }
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionIssue => "connection_issue",
            Self::RateLimitReached => "rate_limit_reached",
            Self::InvalidEndpointUrl => "invalid_endpoint_url",
            Self::ContextLimitReached => "context_limit_reached",
            Self::InvalidApiKey => "invalid_api_key",
            Self::ServiceOverloaded => "service_overloaded",
            Self::Engine { .. } => "engine",
        }
    }

    /// Classify an HTTP status code returned by a remote engine.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::InvalidApiKey,
            413 => Self::ContextLimitReached,
            429 => Self::RateLimitReached,
            503 | 529 => Self::ServiceOverloaded,
            500..=599 => Self::ConnectionIssue,
            _ => Self::Engine {
                message: format!("unexpected status {status}: {body}"),
            },
        }
    }
}

/// Failure reported by a content source while fetching.
/// Never reaches the session error state; fetches degrade to empty content.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content unavailable: {0}")]
    Unavailable(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("content source gone")]
    Gone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ApiError::ConnectionIssue.is_retryable());
        assert!(ApiError::RateLimitReached.is_retryable());
        assert!(ApiError::ServiceOverloaded.is_retryable());
        assert!(!ApiError::InvalidEndpointUrl.is_retryable());
        assert!(!ApiError::InvalidApiKey.is_retryable());
        assert!(!ApiError::ContextLimitReached.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert_eq!(ApiError::from_status(401, String::new()), ApiError::InvalidApiKey);
        assert_eq!(ApiError::from_status(429, String::new()), ApiError::RateLimitReached);
        assert_eq!(ApiError::from_status(529, String::new()), ApiError::ServiceOverloaded);
        assert_eq!(ApiError::from_status(502, String::new()), ApiError::ConnectionIssue);
        assert!(matches!(ApiError::from_status(418, "teapot".into()), ApiError::Engine { .. }));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ApiError::InvalidEndpointUrl.error_kind(), "invalid_endpoint_url");
        assert_eq!(ApiError::Engine { message: "x".into() }.error_kind(), "engine");
    }

    #[test]
    fn serde_uses_kind_tag() {
        let json = serde_json::to_value(ApiError::RateLimitReached).unwrap();
        assert_eq!(json["kind"], "rate_limit_reached");
        let back: ApiError = serde_json::from_value(json).unwrap();
        assert_eq!(back, ApiError::RateLimitReached);
    }
}
