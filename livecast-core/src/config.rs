use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use livecast_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable pointing at a config file
pub const CONFIG_PATH_ENV: &str = "LIVECAST_CONFIG_PATH";

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub chat: ChatConfig,
    pub media: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sustained inbound requests per second allowed on one connection
    pub connection_requests_per_second: u32,
    /// Burst allowance on top of the sustained rate
    pub connection_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            connection_requests_per_second: 20,
            connection_burst: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Chat limits and moderation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Messages kept per stream, oldest evicted first
    pub history_capacity: usize,
    /// Messages returned to a participant on join
    pub join_history: usize,
    pub max_message_length: usize,
    pub max_username_length: usize,
    /// Messages allowed per rate-limit window
    pub rate_limit_messages: u32,
    pub rate_limit_window_secs: u64,
    /// Violations inside the warning window that trigger a timeout
    pub warning_threshold: u32,
    pub warning_window_secs: u64,
    pub timeout_secs: u64,
    /// Interval of the expired-record janitor (0 disables it)
    pub janitor_interval_secs: u64,
    /// Words filtered in addition to the built-in list
    pub extra_blocked_words: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            join_history: 50,
            max_message_length: 500,
            max_username_length: 50,
            rate_limit_messages: 5,
            rate_limit_window_secs: 10,
            warning_threshold: 3,
            warning_window_secs: 600,
            timeout_secs: 300,
            janitor_interval_secs: 60,
            extra_blocked_words: Vec::new(),
        }
    }
}

impl ChatConfig {
    #[must_use]
    pub const fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    #[must_use]
    pub const fn warning_window(&self) -> Duration {
        Duration::from_secs(self.warning_window_secs)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn janitor_interval(&self) -> Option<Duration> {
        if self.janitor_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.janitor_interval_secs))
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided and present)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_SERVER__PORT, LIVECAST_CHAT__TIMEOUT_SECS, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.connection_requests_per_second == 0 {
            errors.push("server.connection_requests_per_second must be positive".to_string());
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level '{}' is not a log level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        let chat = &self.chat;
        if chat.history_capacity == 0 {
            errors.push("chat.history_capacity must be positive".to_string());
        }
        if chat.join_history > chat.history_capacity {
            errors.push(format!(
                "chat.join_history ({}) must not exceed chat.history_capacity ({})",
                chat.join_history, chat.history_capacity
            ));
        }
        if chat.max_message_length == 0 || chat.max_username_length == 0 {
            errors.push("chat message and username limits must be positive".to_string());
        }
        if chat.rate_limit_messages == 0 || chat.rate_limit_window_secs == 0 {
            errors.push("chat rate limit must allow at least one message per window".to_string());
        }
        if chat.warning_threshold == 0 {
            errors.push("chat.warning_threshold must be at least 1".to_string());
        }
        if chat.timeout_secs == 0 {
            errors.push("chat.timeout_secs must be positive".to_string());
        }

        if let Err(media_errors) = self.media.validate() {
            errors.extend(media_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.chat.rate_limit_window(), Duration::from_secs(10));
        assert_eq!(config.chat.timeout(), Duration::from_secs(300));
        assert_eq!(config.chat.janitor_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.chat.join_history = 500;
        config.chat.warning_threshold = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("join_history")));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let path = std::env::temp_dir().join(format!("livecast-{}.yaml", nanoid::nanoid!(8)));
        std::fs::write(
            &path,
            "server:\n  port: 9000\nchat:\n  timeout_secs: 60\n  extra_blocked_words: [\"frak\"]\n",
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.chat.timeout_secs, 60);
        assert_eq!(config.chat.extra_blocked_words, vec!["frak".to_string()]);
        assert_eq!(config.chat.history_capacity, 100);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/livecast.yaml").unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
