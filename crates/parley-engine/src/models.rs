use std::sync::{Arc, LazyLock};

use regex::Regex;

use parley_core::engine::{GenerationEngine, ModelCatalog, ModelInfo};
use parley_core::errors::ApiError;

/// Builds an engine for a validated model.
pub type EngineFactory = Arc<dyn Fn(&ModelInfo) -> Result<Arc<dyn GenerationEngine>, ApiError> + Send + Sync>;

pub const BASIC_MODEL_KEY: &str = "chat-basic";
pub const ADVANCED_MODEL_KEY: &str = "chat-advanced";

static HTTPS_ENDPOINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https://[A-Za-z0-9.\-]+(:\d+)?(/\S*)?$").unwrap());
static LOCAL_ENDPOINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^http://(localhost|127\.0\.0\.1|\[::1\])(:\d+)?(/\S*)?$").unwrap());

/// Custom endpoints must be https, or plain http on loopback.
pub fn is_valid_endpoint(endpoint: &str) -> bool {
    HTTPS_ENDPOINT.is_match(endpoint) || LOCAL_ENDPOINT.is_match(endpoint)
}

pub fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            key: BASIC_MODEL_KEY.into(),
            display_name: "Basic".into(),
            max_content_length: 9_000,
            is_custom: false,
            endpoint: None,
        },
        ModelInfo {
            key: ADVANCED_MODEL_KEY.into(),
            display_name: "Advanced".into(),
            max_content_length: 100_000,
            is_custom: false,
            endpoint: None,
        },
    ]
}

/// Fixed list of models with a shared engine factory.
pub struct StaticModelCatalog {
    models: Vec<ModelInfo>,
    default_key: String,
    factory: EngineFactory,
}

impl StaticModelCatalog {
    pub fn new(models: Vec<ModelInfo>, default_key: impl Into<String>, factory: EngineFactory) -> Self {
        Self {
            models,
            default_key: default_key.into(),
            factory,
        }
    }

    /// Built-in models, every one served by `engine`.
    pub fn with_engine(engine: Arc<dyn GenerationEngine>) -> Self {
        let factory: EngineFactory = Arc::new(move |_| Ok(Arc::clone(&engine)));
        Self::new(builtin_models(), BASIC_MODEL_KEY, factory)
    }

    pub fn add_model(&mut self, model: ModelInfo) {
        self.models.retain(|m| m.key != model.key);
        self.models.push(model);
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn default_model_key(&self) -> String {
        self.default_key.clone()
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn model(&self, key: &str) -> Option<ModelInfo> {
        self.models.iter().find(|m| m.key == key).cloned()
    }

    fn engine_for(&self, key: &str) -> Result<Arc<dyn GenerationEngine>, ApiError> {
        let model = self.model(key).ok_or_else(|| ApiError::Engine {
            message: format!("unknown model {key}"),
        })?;
        if model.is_custom && !model.endpoint.as_deref().is_some_and(is_valid_endpoint) {
            return Err(ApiError::InvalidEndpointUrl);
        }
        (self.factory)(&model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;

    fn custom(endpoint: &str) -> ModelInfo {
        ModelInfo {
            key: "custom-1".into(),
            display_name: "Mine".into(),
            max_content_length: 4_000,
            is_custom: true,
            endpoint: Some(endpoint.into()),
        }
    }

    #[test]
    fn endpoint_validation() {
        assert!(is_valid_endpoint("https://api.example.com/v1/chat"));
        assert!(is_valid_endpoint("http://localhost:8080/v1"));
        assert!(is_valid_endpoint("http://127.0.0.1"));
        assert!(!is_valid_endpoint("http://api.example.com"));
        assert!(!is_valid_endpoint("ftp://example.com"));
        assert!(!is_valid_endpoint("not a url"));
    }

    #[test]
    fn finds_builtin_models() {
        let catalog = StaticModelCatalog::with_engine(Arc::new(MockEngine::new(true)));
        assert_eq!(catalog.default_model_key(), BASIC_MODEL_KEY);
        assert!(catalog.model(ADVANCED_MODEL_KEY).is_some());
        assert!(catalog.model("nope").is_none());
        assert!(catalog.engine_for(BASIC_MODEL_KEY).is_ok());
    }

    #[test]
    fn invalid_custom_endpoint_rejected() {
        let mut catalog = StaticModelCatalog::with_engine(Arc::new(MockEngine::new(true)));
        catalog.add_model(custom("http://remote.example.com"));
        assert!(matches!(catalog.engine_for("custom-1"), Err(ApiError::InvalidEndpointUrl)));

        catalog.add_model(custom("https://remote.example.com"));
        assert!(catalog.engine_for("custom-1").is_ok());
    }
}
