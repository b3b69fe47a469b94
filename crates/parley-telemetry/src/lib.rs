use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("subscriber already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from string settings, e.g. `("warn", [("parley_store", "debug")])`.
    pub fn from_strings<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Result<Self, TelemetryError> {
        let module_levels = modules
            .into_iter()
            .map(|(module, level)| Ok((module.to_string(), parse_level(level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level: parse_level(level)?,
            module_levels,
            json,
        })
    }

    /// `EnvFilter` directives: base level then per-module overrides.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

pub fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    Level::from_str(raw.trim()).map_err(|_| TelemetryError::InvalidLevel(raw.to_string()))
}

/// Initialize the global subscriber. Call once at startup; a second call
/// returns an error.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives())
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialised(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        assert_eq!(TelemetryConfig::default().filter_directives(), "info");
    }

    #[test]
    fn module_overrides_are_appended() {
        let config = TelemetryConfig::from_strings("warn", [("parley_engine", "debug"), ("parley_store", "TRACE")], true)
            .unwrap();
        assert_eq!(config.filter_directives(), "warn,parley_engine=debug,parley_store=trace");
        assert!(config.json);
    }

    #[test]
    fn invalid_level_rejected() {
        assert!(matches!(parse_level("loud"), Err(TelemetryError::InvalidLevel(_))));
        assert!(TelemetryConfig::from_strings("info", [("m", "nope")], false).is_err());
    }

    #[test]
    fn second_init_errors() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(matches!(init_telemetry(&config), Err(TelemetryError::AlreadyInitialised(_))));
    }
}
