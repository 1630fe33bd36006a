//! Configuration loading and persistence.
//!
//! Settings come from the config file, overridden by environment
//! variables, overridden by command-line flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Configuration for both roles of the binary.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Relay URL the agent connects to.
    pub url: String,
    /// Shared key correlating agents with editor sessions ("" = none).
    #[serde(default)]
    pub user_key: String,
    /// Listen address used when running as the relay.
    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7337".to_string(),
            user_key: String::new(),
            bind: "0.0.0.0:7337".to_string(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `TETHER_CONFIG_DIR` overrides the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(override_dir) = std::env::var("TETHER_CONFIG_DIR") {
            PathBuf::from(override_dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("tether")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TETHER_URL") {
            self.url = url;
        }
        if let Ok(user_key) = std::env::var("TETHER_KEY") {
            self.user_key = user_key;
        }
        if let Ok(bind) = std::env::var("TETHER_BIND") {
            self.bind = bind;
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.url, "ws://127.0.0.1:7337");
        assert_eq!(config.user_key, "");
        assert_eq!(config.bind, "0.0.0.0:7337");
    }

    #[test]
    fn test_user_key_defaults_when_absent_from_file() {
        let config: Config =
            serde_json::from_str(r#"{"url":"ws://x:1","bind":"0.0.0.0:1"}"#).unwrap();
        assert_eq!(config.user_key, "");
        assert_eq!(config.url, "ws://x:1");
    }

    #[test]
    fn test_round_trip_serialization() {
        let config = Config {
            url: "wss://relay.example".to_string(),
            user_key: "k".to_string(),
            bind: "127.0.0.1:9000".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url, config.url);
        assert_eq!(back.user_key, config.user_key);
        assert_eq!(back.bind, config.bind);
    }
}
