//! Command-line configuration file.

use anyhow::{Context, Result};
use groupflow_execution::{EngineConfig, LockConfig};
use groupflow_state::RetentionPolicy;
use serde::Deserialize;
use std::path::Path;

/// Settings read from `--config`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node-graph server
    pub server_url: String,
    /// Session id to run under; generated when absent
    pub session_id: Option<String>,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Engine settings
    pub engine: EngineConfig,
    /// Lock settings
    pub lock: LockConfig,
    /// State retention
    pub retention: RetentionPolicy,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8188".to_string(),
            session_id: None,
            request_timeout_secs: 30,
            engine: EngineConfig::default(),
            lock: LockConfig::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl CliConfig {
    /// Load from a file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply command-line overrides.
    pub fn with_server(mut self, server: Option<String>) -> Self {
        if let Some(server) = server {
            self.server_url = server;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = CliConfig::load(None).unwrap();
        assert_eq!(config, CliConfig::default());
        assert_eq!(config.engine.poll_interval_ms, 500);
        assert_eq!(config.lock.lock_timeout_secs, 3600);
        assert_eq!(config.retention.max_entries, 100);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "server_url": "http://gpu-box:8188", "engine": {{ "queue_wait_ceiling_secs": 600 }}, "retention": {{ "max_entries": 10 }} }}"#
        )
        .unwrap();

        let config = CliConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server_url, "http://gpu-box:8188");
        assert_eq!(config.engine.queue_wait_ceiling_secs, 600);
        assert_eq!(config.engine.poll_interval_ms, 500);
        assert_eq!(config.retention.max_entries, 10);
        assert_eq!(config.retention.completed_ttl_secs, 3600);
    }

    #[test]
    fn test_server_override() {
        let config = CliConfig::default().with_server(Some("http://other:9000".into()));
        assert_eq!(config.server_url, "http://other:9000");
        assert_eq!(CliConfig::default().with_server(None), CliConfig::default());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server_url = 1").unwrap();
        let err = CliConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config"));
    }
}
