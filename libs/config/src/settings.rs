//! Settings Module
//!
//! Provides loading and management of communication settings.
//! Supports loading from TOML files with environment variable overrides.

use crate::comm;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Process-wide communication settings
///
/// Every field has a default, so a settings file only needs to name the
/// values it changes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CommSettings {
    /// Directory for Unix domain sockets
    pub socket_dir: PathBuf,
    /// Maximum payload bytes per frame
    pub max_frame_size: usize,
    /// Largest reassembled message in bytes
    pub max_message_size: usize,
    /// In-process queue capacity in frames
    pub queue_capacity: usize,
    /// Ceiling for `close(drain = true)` in milliseconds
    pub drain_timeout_ms: u64,
    /// Default receive timeout in milliseconds
    pub recv_timeout_ms: u64,
    /// Backlog loop sleep in milliseconds
    pub backlog_sleep_ms: u64,
    /// Ceiling for one oversized transfer in milliseconds
    pub work_timeout_ms: u64,
    pub log_level: String,
}

impl Default for CommSettings {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(comm::DEFAULT_SOCKET_DIR),
            max_frame_size: comm::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: comm::DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: comm::DEFAULT_QUEUE_CAPACITY,
            drain_timeout_ms: comm::DEFAULT_DRAIN_TIMEOUT_MS,
            recv_timeout_ms: comm::DEFAULT_RECV_TIMEOUT_MS,
            backlog_sleep_ms: comm::DEFAULT_BACKLOG_SLEEP_MS,
            work_timeout_ms: comm::DEFAULT_WORK_TIMEOUT_MS,
            log_level: "info".to_string(),
        }
    }
}

impl CommSettings {
    /// Load settings from an optional TOML file with environment overrides
    ///
    /// Environment variables are read as `<PREFIX>_<FIELD>`, e.g.
    /// `COMM_MAX_FRAME_SIZE=4096`.
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading communication settings: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(env_prefix).try_parsing(true));

        let config = builder
            .build()
            .context("Failed to build communication settings")?;

        let mut settings: CommSettings = config
            .try_deserialize()
            .context("Failed to deserialize communication settings")?;
        settings.expand_env_vars()?;
        settings.validate()?;

        debug!(?settings, "Communication settings loaded");
        Ok(settings)
    }

    /// Expand environment variables in path values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let raw = self.socket_dir.to_string_lossy().to_string();
        let expanded = shellexpand::full(&raw).context("Failed to expand socket directory")?;
        self.socket_dir = PathBuf::from(expanded.as_ref());
        Ok(())
    }

    /// Reject values no channel can operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            anyhow::bail!("max_frame_size cannot be zero");
        }
        if self.max_message_size < self.max_frame_size {
            anyhow::bail!("max_message_size cannot be below max_frame_size");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity cannot be zero");
        }
        Ok(())
    }

    /// Serialize settings back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize communication settings")
    }
}

/// Convenience function to load settings with the default `COMM` prefix
pub fn load_settings(path: Option<&Path>) -> Result<CommSettings> {
    CommSettings::load(path, "COMM")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let settings = CommSettings::load(None, "COMM_TEST_DEFAULTS").unwrap();
        assert_eq!(settings, CommSettings::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comm.toml");

        fs::write(
            &path,
            r#"
socket_dir = "/tmp/comm-test"
max_frame_size = 4096
log_level = "debug"
"#,
        )
        .unwrap();

        let settings = CommSettings::load(Some(&path), "COMM_TEST_PARTIAL").unwrap();
        assert_eq!(settings.socket_dir, PathBuf::from("/tmp/comm-test"));
        assert_eq!(settings.max_frame_size, 4096);
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.queue_capacity, comm::DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("COMM_TEST_ENV_DRAIN_TIMEOUT_MS", "250");
        let settings = CommSettings::load(None, "COMM_TEST_ENV").unwrap();
        std::env::remove_var("COMM_TEST_ENV_DRAIN_TIMEOUT_MS");

        assert_eq!(settings.drain_timeout_ms, 250);
    }

    #[test]
    fn test_zero_frame_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comm.toml");
        fs::write(&path, "max_frame_size = 0\n").unwrap();

        assert!(CommSettings::load(Some(&path), "COMM_TEST_ZERO").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = CommSettings::default();
        let text = settings.to_toml().unwrap();
        let parsed: CommSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
