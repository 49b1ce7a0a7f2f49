// Configuration management for the epdlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/epdlink/config.json
// - Linux: ~/.config/epdlink/config.json
// - Windows: %APPDATA%\epdlink\config.json

use anyhow::{Context, Result};
use epdlink_core::{EpdConfig, PanelType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session manager and task settings
    pub epd: EpdConfig,

    /// Panel used when a command does not name one
    pub default_panel: PanelType,

    /// Disconnect after every task
    pub auto_disconnect: bool,

    /// Log as JSON lines
    pub log_json: bool,

    /// Directory for daily rolling log files; stderr only when unset
    pub log_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epd: EpdConfig::default(),
            default_panel: PanelType::Epd250,
            auto_disconnect: true,
            log_json: false,
            log_dir: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("epdlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .epd
                .validate()
                .context("Invalid settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value; the result is validated before it is accepted
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "max_sessions" => next.epd.max_sessions = value.parse().context("Invalid number")?,
            "mtu" => next.epd.mtu = value.parse().context("Invalid MTU")?,
            "connect_timeout_ms" => {
                next.epd.connect_timeout_ms = value.parse().context("Invalid number")?
            }
            "task_timeout_ms" => next.epd.task_timeout_ms = value.parse().context("Invalid number")?,
            "settle_delay_ms" => next.epd.settle_delay_ms = value.parse().context("Invalid number")?,
            "max_retries" => next.epd.max_retries = value.parse().context("Invalid number")?,
            "scan_prefix" => {
                next.epd.scan.name_prefix = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_duration_ms" => {
                next.epd.scan.default_duration_ms = value.parse().context("Invalid number")?
            }
            "default_panel" => {
                next.default_panel = value
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?
            }
            "auto_disconnect" => {
                next.auto_disconnect = value.parse().context("Invalid boolean value")?
            }
            "log_json" => next.log_json = value.parse().context("Invalid boolean value")?,
            "log_dir" => {
                next.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.epd.validate().context("Rejected config value")?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("max_sessions".to_string(), self.epd.max_sessions.to_string()),
            ("mtu".to_string(), self.epd.mtu.to_string()),
            (
                "connect_timeout_ms".to_string(),
                self.epd.connect_timeout_ms.to_string(),
            ),
            ("task_timeout_ms".to_string(), self.epd.task_timeout_ms.to_string()),
            ("settle_delay_ms".to_string(), self.epd.settle_delay_ms.to_string()),
            ("max_retries".to_string(), self.epd.max_retries.to_string()),
            (
                "scan_prefix".to_string(),
                self.epd.scan.name_prefix.clone().unwrap_or_default(),
            ),
            (
                "scan_duration_ms".to_string(),
                self.epd.scan.default_duration_ms.to_string(),
            ),
            ("default_panel".to_string(), self.default_panel.name().to_string()),
            ("auto_disconnect".to_string(), self.auto_disconnect.to_string()),
            ("log_json".to_string(), self.log_json.to_string()),
            ("log_dir".to_string(), self.log_dir.clone().unwrap_or_default()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.epd.max_sessions, 4);
        assert_eq!(config.default_panel, PanelType::Epd250);
        assert!(config.auto_disconnect);
    }

    #[test]
    fn test_first_load_creates_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let config = Config::load_from(&path).expect("load");
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_set_persists_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = Config::load_from(&path).expect("load");
        config.set("max_retries", "3").expect("set");
        config.set("default_panel", "EPD-353").expect("set");
        config.set("scan_prefix", "").expect("set");
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("reload");
        assert_eq!(loaded.get("max_retries").as_deref(), Some("3"));
        assert_eq!(loaded.default_panel, PanelType::Epd353);
        assert_eq!(loaded.epd.scan.name_prefix, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config.set("mtu", "10").is_err());
        assert!(config.set("max_sessions", "0").is_err());
        assert!(config.set("default_panel", "EPD-999").is_err());
        assert!(config.set("nope", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auto_disconnect": false}"#).expect("write");
        let config = Config::load_from(&path).expect("load");
        assert!(!config.auto_disconnect);
        assert_eq!(config.epd, EpdConfig::default());
    }
}
