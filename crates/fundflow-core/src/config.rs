//! Application configuration management.
//!
//! Configuration is stored at `~/.config/fundflow/config.json` and holds the
//! backend URL, the session check interval, an optional request timeout and
//! the last email used to sign in. `FUNDFLOW_API_URL` overrides the stored
//! URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::CHECK_AUTH_INTERVAL;

/// Application name used for config/data directory paths
const APP_NAME: &str = "fundflow";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_url`
pub const API_URL_ENV: &str = "FUNDFLOW_API_URL";

/// Backend used when nothing is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub check_auth_interval_secs: u64,
    /// No timeout when unset; a hung request waits indefinitely
    pub request_timeout_secs: Option<u64>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            check_auth_interval_secs: CHECK_AUTH_INTERVAL.as_secs(),
            request_timeout_secs: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the user config directory, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(url) = std::env::var(API_URL_ENV) {
            config.set_api_url(&url);
        }
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        let url = config.api_url.clone();
        config.set_api_url(&url);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn set_api_url(&mut self, url: &str) {
        self.api_url = url.trim().trim_end_matches('/').to_string();
    }

    pub fn check_auth_interval(&self) -> Duration {
        // Zero would make the poller spin
        Duration::from_secs(self.check_auth_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the credential store
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.check_auth_interval(), Duration::from_secs(60));
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = Config::default();
        config.set_api_url("https://api.example.org/ ");
        config.last_email = Some("ada@example.org".to_string());
        config.request_timeout_secs = Some(15);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_url, "https://api.example.org");
        assert_eq!(loaded.last_email.as_deref(), Some("ada@example.org"));
        assert_eq!(loaded.request_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"check_auth_interval_secs": 0}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.check_auth_interval(), Duration::from_secs(1));
    }
}
