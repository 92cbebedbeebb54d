//! Engine configuration.
//!
//! Defaults are suitable for tests; deployments override them through
//! `CHANNELTREE_*` environment variables.

use crate::db::DEFAULT_BUSY_TIMEOUT_MS;
use crate::services::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_BATCH_SIZE: &str = "CHANNELTREE_BATCH_SIZE";
pub const ENV_BUSY_TIMEOUT_MS: &str = "CHANNELTREE_BUSY_TIMEOUT_MS";
pub const ENV_DB_PATH: &str = "CHANNELTREE_DB_PATH";

/// Configuration for the tree engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEngineConfig {
    /// Span below which a subtree is copied in one transaction (default: 100)
    pub batch_size: i64,
    /// How long SQLite waits on a locked database before reporting busy (default: 5000)
    pub busy_timeout_ms: u64,
    /// Database file for the libsql backend
    pub database_path: Option<PathBuf>,
}

impl Default for TreeEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            database_path: None,
        }
    }
}

impl TreeEngineConfig {
    /// Defaults overlaid with the `CHANNELTREE_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = value
                .trim()
                .parse()
                .map_err(|e| format!("{} must be an integer: {}", ENV_BATCH_SIZE, e))?;
        }
        if let Some(value) = lookup(ENV_BUSY_TIMEOUT_MS) {
            config.busy_timeout_ms = value
                .trim()
                .parse()
                .map_err(|e| format!("{} must be an integer: {}", ENV_BUSY_TIMEOUT_MS, e))?;
        }
        if let Some(value) = lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(value));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size < 1 {
            return Err(format!("batch_size must be at least 1, got {}", self.batch_size));
        }
        if self.busy_timeout_ms == 0 {
            return Err("busy_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TreeEngineConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.database_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = TreeEngineConfig::from_lookup(lookup(&[
            (ENV_BATCH_SIZE, "25"),
            (ENV_BUSY_TIMEOUT_MS, " 250 "),
            (ENV_DB_PATH, "/tmp/tree.db"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/tree.db")));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = TreeEngineConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "many")])).unwrap_err();
        assert!(err.contains(ENV_BATCH_SIZE));

        let err = TreeEngineConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "0")])).unwrap_err();
        assert!(err.contains("batch_size"));
    }

    #[test]
    fn test_config_serializes_camel_case() {
        let json = serde_json::to_value(TreeEngineConfig::default()).unwrap();
        assert_eq!(json["batchSize"], 100);
        assert_eq!(json["busyTimeoutMs"], 5000);
    }
}
