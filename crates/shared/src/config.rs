//! Configuration management for the stream resolver.
//!
//! Loads settings from a TOML file with sensible defaults for every
//! section, so the service runs without a config file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Crawling substrate settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Task orchestration settings
    #[serde(default)]
    pub tasks: TaskConfig,

    /// animepahe source settings
    #[serde(default)]
    pub animepahe: AnimepaheConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log directory path
    pub log_dir: String,

    /// Default log level (trace, debug, info, warn, error)
    pub default_level: String,

    /// Enable console output
    pub console: bool,

    /// Enable file output
    pub file: bool,

    /// Enable JSON formatting for file logs
    pub json_format: bool,
}

/// Crawling substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Minimum spacing between request starts in milliseconds
    pub min_request_interval_ms: u64,

    /// Maximum retries for raw fetches
    pub raw_max_retries: u32,

    /// Maximum retries for rendered fetches
    pub rendered_max_retries: u32,

    /// Base delay for retry backoff in milliseconds
    pub retry_delay_ms: u64,
}

/// Task orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum number of tasks retained in the table
    pub max_tasks: usize,

    /// Seconds a terminal task is retained before reclamation may purge it
    pub task_ttl_secs: u64,

    /// Seconds between reclamation passes
    pub reclaim_interval_secs: u64,

    /// Hard timeout for one resolution run in seconds
    pub pipeline_timeout_secs: u64,
}

/// animepahe source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimepaheConfig {
    /// Site base URL
    pub base_url: String,

    /// Session cookie sent with every request to the site
    pub cookie: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            default_level: "info".to_string(),
            console: true,
            file: true,
            json_format: false,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            min_request_interval_ms: 250,
            raw_max_retries: 3,
            rendered_max_retries: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_tasks: 512,
            task_ttl_secs: 3600,
            reclaim_interval_secs: 300,
            pipeline_timeout_secs: 180,
        }
    }
}

impl Default for AnimepaheConfig {
    fn default() -> Self {
        Self {
            base_url: "https://animepahe.ru".to_string(),
            cookie: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            fetch: FetchConfig::default(),
            tasks: TaskConfig::default(),
            animepahe: AnimepaheConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from a TOML file or fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::from_file(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load config, using defaults");
            Self::default()
        })
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

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
        assert_eq!(config.logging.default_level, "info");
        assert_eq!(config.fetch.raw_max_retries, 3);
        assert_eq!(config.fetch.rendered_max_retries, 5);
        assert_eq!(config.animepahe.base_url, "https://animepahe.ru");
        assert!(config.tasks.max_tasks > 0);
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.animepahe.cookie = "__ddg=1".to_string();
        original.save(&config_path)?;

        let loaded = Config::from_file(&config_path)?;
        assert_eq!(loaded.animepahe.cookie, "__ddg=1");
        assert_eq!(loaded.fetch.timeout_secs, original.fetch.timeout_secs);

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.logging.log_dir, "logs");
    }

    #[test]
    fn test_partial_config_fills_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[animepahe]\nbase_url = \"https://example.test\"\ncookie = \"\"\n")?;

        let config = Config::from_file(&config_path)?;
        assert_eq!(config.animepahe.base_url, "https://example.test");
        assert_eq!(config.fetch.timeout_secs, 30);

        Ok(())
    }
}
