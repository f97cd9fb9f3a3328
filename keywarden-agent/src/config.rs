//! Agent configuration: YAML file at `~/.keywarden/config.yaml`.
//!
//! Every field is live-editable from the UI settings page. The shared
//! handle serializes access: exclusive for writes, shared for reads.

use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const CONFIG_DIR: &str = ".keywarden";
const CONFIG_FILE: &str = "config.yaml";

/// Allowed bounds for the synchronization interval, in seconds.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 10;
pub const MAX_SYNC_INTERVAL_SECS: u64 = 1800;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Agent working mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Every read goes to the server.
    #[default]
    Server,
    /// Reads served from the local cache, kept convergent by the sync engine.
    Local,
}

/// Configuration parameters of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub user: String,
    /// Secret key used to unwrap the encryption key received from the server.
    #[serde(default)]
    pub secretkey: String,
    /// Server address in host:port form.
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub mode: AgentMode,
    /// Interval between synchronizations with the server, in seconds.
    #[serde(default = "default_sync_interval")]
    pub syncinterval: u64,
    /// Show sensitive values by default in the UI.
    #[serde(default)]
    pub showsensitive: bool,
    #[serde(default = "default_log_level")]
    pub loglevel: String,
    /// Path to an extra CA root certificate (PEM).
    #[serde(default)]
    pub cacert: String,
    /// Disable TLS; for testing and lab environments only.
    #[serde(default)]
    pub disabletls: bool,
    /// Directory for local cache files; defaults to the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datadir: Option<PathBuf>,
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            secretkey: String::new(),
            server: String::new(),
            mode: AgentMode::Server,
            syncinterval: DEFAULT_SYNC_INTERVAL_SECS,
            showsensitive: false,
            loglevel: default_log_level(),
            cacert: String::new(),
            disabletls: false,
            datadir: None,
        }
    }
}

impl AgentConfig {
    /// Directory holding the config file and the local cache files.
    pub fn config_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join(CONFIG_FILE)
    }

    /// Load from an explicit path, or from the default location.
    ///
    /// A missing file yields the defaults; the caller decides whether the
    /// result is complete enough via [`Self::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&raw).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Persist to the given path, creating the parent directory if needed.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let raw = serde_yaml::to_string(self).map_err(|e| AgentError::Config(e.to_string()))?;
        std::fs::write(&path, raw)?;
        Ok(())
    }

    /// Check that the configuration is complete and in bounds.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(AgentError::Config("user is empty, must be set".to_string()));
        }
        if self.secretkey.is_empty() {
            return Err(AgentError::Config(
                "secret key is empty, must be set".to_string(),
            ));
        }
        if self.server.is_empty() {
            return Err(AgentError::Config(
                "server address is empty, must be set".to_string(),
            ));
        }
        if !(MIN_SYNC_INTERVAL_SECS..=MAX_SYNC_INTERVAL_SECS).contains(&self.syncinterval) {
            return Err(AgentError::Config(format!(
                "sync interval must be between {MIN_SYNC_INTERVAL_SECS} and {MAX_SYNC_INTERVAL_SECS} seconds"
            )));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.syncinterval)
    }

    /// Directory where per-user cache files live.
    pub fn data_dir(&self) -> PathBuf {
        self.datadir.clone().unwrap_or_else(Self::config_dir)
    }
}

/// Shared configuration handle: exclusive write, shared read.
pub type SharedConfig = Arc<RwLock<AgentConfig>>;

/// Wrap a configuration for shared use.
pub fn shared(config: AgentConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            user: "alice".to_string(),
            secretkey: "cisco-123".to_string(),
            server: "vault.example.com:3200".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn yaml_roundtrip() {
        let config = AgentConfig {
            mode: AgentMode::Local,
            syncinterval: 120,
            ..valid()
        };

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("mode: local"));

        let back: AgentConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.user, "alice");
        assert_eq!(back.mode, AgentMode::Local);
        assert_eq!(back.syncinterval, 120);
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let back: AgentConfig = serde_yaml::from_str("user: bob\n").unwrap();
        assert_eq!(back.user, "bob");
        assert_eq!(back.mode, AgentMode::Server);
        assert_eq!(back.syncinterval, DEFAULT_SYNC_INTERVAL_SECS);
        assert!(!back.disabletls);
    }

    #[test]
    fn validation_catches_missing_fields() {
        assert!(valid().validate().is_ok());

        let mut c = valid();
        c.user.clear();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.secretkey.clear();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.server.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn validation_bounds_sync_interval() {
        let mut c = valid();
        c.syncinterval = 9;
        assert!(c.validate().is_err());
        c.syncinterval = 10;
        assert!(c.validate().is_ok());
        c.syncinterval = 1800;
        assert!(c.validate().is_ok());
        c.syncinterval = 1801;
        assert!(c.validate().is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = std::env::temp_dir().join(format!("kw-config-{}", std::process::id()));
        let path = dir.join("config.yaml");
        let config = valid();

        config.save(Some(&path)).unwrap();
        let back = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(back.user, config.user);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let back = AgentConfig::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap();
        assert!(back.user.is_empty());
        assert!(back.validate().is_err());
    }
}
