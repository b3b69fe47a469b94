//! Settings loading.
//!
//! Compiled defaults, then `~/.parley/settings.json` deep-merged on top,
//! then `PARLEY_*` environment overrides. Nulls in the file keep the
//! default; arrays and scalars replace it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use parley_engine::context::DEFAULT_SUGGESTION_SAMPLE_SIZE;
use parley_engine::models::BASIC_MODEL_KEY;
use parley_telemetry::TelemetryConfig;

use crate::error::{SettingsError, SettingsResult};

const MAX_UNLOAD_DELAY_MS: u64 = 3_600_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParleySettings {
    /// Persist non-temporary conversations to the store.
    pub history_enabled: bool,
    pub default_model: String,
    /// Grace period before an idle session is unloaded.
    pub unload_delay_ms: u64,
    pub suggestion_sample_size: usize,
    /// `None` means `~/.parley/parley.db`.
    pub database_path: Option<String>,
    pub logging: LoggingSettings,
}

impl Default for ParleySettings {
    fn default() -> Self {
        Self {
            history_enabled: true,
            default_model: BASIC_MODEL_KEY.to_string(),
            unload_delay_ms: 5_000,
            suggestion_sample_size: DEFAULT_SUGGESTION_SAMPLE_SIZE,
            database_path: None,
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"parley_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl ParleySettings {
    pub fn unload_delay(&self) -> Duration {
        Duration::from_millis(self.unload_delay_ms)
    }

    pub fn telemetry_config(&self) -> SettingsResult<TelemetryConfig> {
        TelemetryConfig::from_strings(
            &self.logging.level,
            self.logging.modules.iter().map(|(m, l)| (m.as_str(), l.as_str())),
            self.logging.json,
        )
        .map_err(|e| SettingsError::InvalidValue(e.to_string()))
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(path),
            None => parley_dir().join("parley.db"),
        }
    }
}

fn parley_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// `$PARLEY_SETTINGS` if set, else `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    match std::env::var("PARLEY_SETTINGS") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => parley_dir().join("settings.json"),
    }
}

pub fn load_settings() -> SettingsResult<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults. Malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> SettingsResult<ParleySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> SettingsResult<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings");
        let raw = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&raw)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key; everything else is replaced. Null source values
/// are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                if value.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Invalid values are logged and ignored.
fn apply_overrides(settings: &mut ParleySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(raw) = read("PARLEY_HISTORY_ENABLED") {
        match parse_bool(&raw) {
            Some(v) => settings.history_enabled = v,
            None => warn!(key = "PARLEY_HISTORY_ENABLED", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_DEFAULT_MODEL") {
        settings.default_model = v;
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PARLEY_DB_PATH") {
        settings.database_path = Some(v);
    }
    if let Some(raw) = read("PARLEY_UNLOAD_DELAY_MS") {
        match parse_u64_range(&raw, 0, MAX_UNLOAD_DELAY_MS) {
            Some(v) => settings.unload_delay_ms = v,
            None => warn!(key = "PARLEY_UNLOAD_DELAY_MS", value = %raw, "invalid delay env var, ignoring"),
        }
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
