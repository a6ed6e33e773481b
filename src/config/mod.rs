//! Configuration management for soundwatch
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Telegram bot configuration
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Polling configuration
    #[serde(default)]
    pub poll: PollConfig,

    /// Remote page fetching configuration
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Telegram bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Environment variable name holding the bot token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Bot API base URL
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,

    /// Optional chat that receives scheduler-level error reports
    #[serde(default)]
    pub admin_chat_id: Option<i64>,
}

impl TelegramConfig {
    /// Read the bot token from the configured environment variable
    pub fn token(&self) -> Result<String> {
        match std::env::var(&self.token_env) {
            Ok(token) if !token.is_empty() => Ok(token),
            _ => Err(Error::Config(format!(
                "Telegram bot token not set; export {}",
                self.token_env
            ))),
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between scheduler cycles
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Maximum notifications on the first-ever poll of a target
    #[serde(default = "default_first_poll_cap")]
    pub first_poll_cap: usize,

    /// Bound on the persisted last-seen id set per target
    #[serde(default = "default_max_seen_ids")]
    pub max_seen_ids: usize,

    /// Maximum items taken from a fetched page
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
}

/// Remote page fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Base URL of the remote platform
    #[serde(default = "default_fetch_base_url")]
    pub base_url: String,

    /// Optional outbound HTTP proxy
    #[serde(default)]
    pub http_proxy: Option<String>,

    /// User agent string
    #[serde(default = "default_fetch_user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Outbound requests per second
    #[serde(default = "default_fetch_rate_limit")]
    pub rate_limit_per_sec: u32,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for soundwatch data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            poll: PollConfig::default(),
            fetch: FetchConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            api_url: default_telegram_api_url(),
            admin_chat_id: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            first_poll_cap: default_first_poll_cap(),
            max_seen_ids: default_max_seen_ids(),
            fetch_limit: default_fetch_limit(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_fetch_base_url(),
            http_proxy: None,
            user_agent: default_fetch_user_agent(),
            timeout_secs: default_fetch_timeout(),
            rate_limit_per_sec: default_fetch_rate_limit(),
        }
    }
}

impl Config {
    /// Get the default base directory for soundwatch (~/.soundwatch)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".soundwatch")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("soundwatch.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Set up paths based on config file location
        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("soundwatch.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
            config.validate()?;
        } else {
            debug!("No config file found, using defaults");
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if soundwatch is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_secs == 0 {
            return Err(Error::Config(
                "poll.interval_secs must be positive".to_string(),
            ));
        }

        if self.poll.first_poll_cap == 0 {
            return Err(Error::Config(
                "poll.first_poll_cap must be positive".to_string(),
            ));
        }

        if self.poll.max_seen_ids == 0 {
            return Err(Error::Config(
                "poll.max_seen_ids must be positive".to_string(),
            ));
        }

        if self.poll.fetch_limit == 0 {
            return Err(Error::Config(
                "poll.fetch_limit must be positive".to_string(),
            ));
        }

        if self.fetch.rate_limit_per_sec == 0 {
            return Err(Error::Config(
                "fetch.rate_limit_per_sec must be positive".to_string(),
            ));
        }

        if self.fetch.base_url.is_empty() {
            return Err(Error::Config("fetch.base_url must not be empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll.interval_secs, 180);
        assert_eq!(config.poll.first_poll_cap, 3);
        assert_eq!(config.fetch.base_url, "https://www.tiktok.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.poll.interval_secs = 60;
        config.telegram.admin_chat_id = Some(42);

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.poll.interval_secs, 60);
        assert_eq!(loaded.telegram.admin_chat_id, Some(42));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.poll.interval_secs = 0;
        assert!(config.validate().is_err());

        config.poll.interval_secs = 180;
        assert!(config.validate().is_ok());

        config.poll.first_poll_cap = 0;
        assert!(config.validate().is_err());

        config.poll.first_poll_cap = 3;
        config.fetch.rate_limit_per_sec = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_requires_env() {
        let mut config = Config::default();
        config.telegram.token_env = "SOUNDWATCH_TEST_TOKEN_UNSET".to_string();
        assert!(config.telegram.token().is_err());
    }
}
