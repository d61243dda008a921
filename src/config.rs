//! Flat hierarchical configuration.
//!
//! Keys follow `<module>.<key>` (for example `model.name` or
//! `rag.chunk_size`). Values are strings; callers parse them on access.
//! [`AppConfig::overlay_env`] merges process environment variables on top
//! after loading `.env` through `dotenvy`: `AWEL_MODEL__NAME=x` becomes
//! `model.name = x` (double underscore separates levels).

use rustc_hash::FxHashMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

const ENV_PREFIX: &str = "AWEL_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config key: {key}")]
    Missing { key: String },

    #[error("config key {key} has unparseable value {value:?}")]
    Parse { key: String, value: String },
}

#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    values: FxHashMap<String, String>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Typed access; missing and malformed values are distinct errors.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        let raw = self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })?;
        raw.parse().map_err(|_| ConfigError::Parse {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// View of all keys under `module.`, with the prefix stripped.
    pub fn with_prefix(&self, module: &str) -> AppConfig {
        let prefix = format!("{module}.");
        let values = self
            .values
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        AppConfig { values }
    }

    /// Load `.env` if present, then merge `AWEL_`-prefixed environment
    /// variables over the current values.
    pub fn overlay_env(&mut self) {
        // Missing .env files are fine; real errors only get a debug line
        // since config can still come from the process environment.
        if let Err(err) = dotenvy::dotenv() {
            debug!(error = %err, "no .env file loaded");
        }
        for (name, value) in std::env::vars() {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = rest.to_lowercase().replace("__", ".");
            self.values.insert(key, value);
        }
    }

    /// Comma-separated API key allow-list from `api_keys`, when set.
    pub fn api_keys(&self) -> ApiKeys {
        ApiKeys {
            keys: self.get("api_keys").map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
        }
    }
}

/// Optional API key allow-list. No configured list means every caller is
/// allowed.
#[derive(Clone, Debug, Default)]
pub struct ApiKeys {
    keys: Option<Vec<String>>,
}

impl ApiKeys {
    pub fn allow_all() -> Self {
        Self { keys: None }
    }

    pub fn from_list(keys: Vec<String>) -> Self {
        Self { keys: Some(keys) }
    }

    pub fn is_allowed(&self, presented: Option<&str>) -> bool {
        match &self.keys {
            None => true,
            Some(keys) if keys.is_empty() => true,
            Some(keys) => presented.is_some_and(|key| keys.iter().any(|k| k == key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_view_strips_module() {
        let mut config = AppConfig::new();
        config.set("model.name", "proxy/gpt");
        config.set("model.temperature", "0.7");
        config.set("rag.topk", "4");

        let model = config.with_prefix("model");
        assert_eq!(model.get("name"), Some("proxy/gpt"));
        assert_eq!(model.get_parsed::<f32>("temperature").unwrap(), 0.7);
        assert_eq!(model.get("topk"), None);
    }

    #[test]
    fn parse_errors_are_distinct_from_missing() {
        let mut config = AppConfig::new();
        config.set("rag.topk", "four");
        assert!(matches!(
            config.get_parsed::<usize>("rag.topk"),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            config.get_parsed::<usize>("rag.missing"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn absent_api_keys_allow_everyone() {
        let config = AppConfig::new();
        assert!(config.api_keys().is_allowed(None));
        assert!(config.api_keys().is_allowed(Some("anything")));
    }

    #[test]
    fn configured_api_keys_gate_callers() {
        let mut config = AppConfig::new();
        config.set("api_keys", "alpha, beta");
        let keys = config.api_keys();
        assert!(keys.is_allowed(Some("alpha")));
        assert!(keys.is_allowed(Some("beta")));
        assert!(!keys.is_allowed(Some("gamma")));
        assert!(!keys.is_allowed(None));
    }
}
