//! Configuration for the session registry.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (JSON)
//! 3. Default values

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Allow checkout of hierarchical (child) sessions.
    ///
    /// When disabled, [`SessionRegistry::check_out`](crate::SessionRegistry::check_out)
    /// with a child-session id fails with `InvalidOptions`.
    pub enable_child_sessions: bool,
    /// Poll backstop for blocking checkout waits, in milliseconds.
    ///
    /// A parked waiter re-checks its interrupt flag at least this often,
    /// bounding the delay of an interrupt delivered in the window between
    /// the flag check and the park.
    pub wait_poll_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enable_child_sessions: true,
            wait_poll_ms: 100,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(enabled) = std::env::var("SESSION_ARBITER_ENABLE_CHILD_SESSIONS") {
            if let Ok(value) = enabled.parse() {
                self.enable_child_sessions = value;
            }
        }
        if let Ok(poll) = std::env::var("SESSION_ARBITER_WAIT_POLL_MS") {
            if let Ok(value) = poll.parse() {
                self.wait_poll_ms = value;
            }
        }
    }

    /// Load from file (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Json(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert!(config.enable_child_sessions);
        assert_eq!(config.wait_poll_ms, 100);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"enable_child_sessions": false, "wait_poll_ms": 25}}"#
        )
        .unwrap();

        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert!(!config.enable_child_sessions);
        assert_eq!(config.wait_poll_ms, 25);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"wait_poll_ms": 10}}"#).unwrap();

        let config = RegistryConfig::from_file(file.path()).unwrap();
        // Unspecified fields fall back to defaults
        assert!(config.enable_child_sessions);
        assert_eq!(config.wait_poll_ms, 10);
    }

    #[test]
    fn test_from_file_missing() {
        let result = RegistryConfig::from_file(Path::new("/nonexistent/config.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_from_file_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let result = RegistryConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }
}
