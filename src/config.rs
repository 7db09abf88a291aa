//! Configuration management for Chapterflow
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{ChapterflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Chapterflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database location and retention limits
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session view cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Generation pipeline deadlines and retention
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; the platform data directory is used when unset
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// How long a writer waits on a locked database (milliseconds)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Records kept per session before the oldest are pruned
    #[serde(default = "default_max_history")]
    pub default_max_history: u32,

    /// Sessions kept by the global retention sweep
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_history() -> u32 {
    30
}

fn default_max_sessions() -> u32 {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            default_max_history: default_max_history(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl StorageConfig {
    /// Busy timeout as a [`Duration`]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Session view cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the facade caches session views at all
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Maximum age of a cached view before it is reloaded (seconds)
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_staleness_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            staleness_secs: default_staleness_secs(),
        }
    }
}

/// Generation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Terminal jobs older than this are removed by the sweep (days)
    #[serde(default = "default_job_retention_days")]
    pub job_retention_days: u32,

    /// Attempts made when two writers race for the same chunk sequence
    #[serde(default = "default_chunk_insert_retries")]
    pub chunk_insert_retries: u32,

    /// Keyword extraction deadline (seconds)
    #[serde(default = "default_keyword_timeout")]
    pub keyword_timeout_secs: u64,

    /// Web search deadline (seconds)
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,

    /// Private document retrieval deadline (seconds)
    #[serde(default = "default_retrieval_timeout")]
    pub retrieval_timeout_secs: u64,

    /// Prompt assembly deadline (seconds)
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,

    /// Language model call deadline (seconds)
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,

    /// Reference post-processing deadline (seconds)
    #[serde(default = "default_reference_timeout")]
    pub reference_timeout_secs: u64,

    /// Search results kept per keyword
    #[serde(default = "default_top_k")]
    pub search_top_k: usize,

    /// Private passages requested per chapter
    #[serde(default = "default_top_k")]
    pub retrieval_top_k: usize,
}

fn default_job_retention_days() -> u32 {
    7
}

fn default_chunk_insert_retries() -> u32 {
    3
}

fn default_keyword_timeout() -> u64 {
    30
}

fn default_search_timeout() -> u64 {
    60
}

fn default_retrieval_timeout() -> u64 {
    60
}

fn default_prompt_timeout() -> u64 {
    60
}

fn default_model_timeout() -> u64 {
    180
}

fn default_reference_timeout() -> u64 {
    60
}

fn default_top_k() -> usize {
    5
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            job_retention_days: default_job_retention_days(),
            chunk_insert_retries: default_chunk_insert_retries(),
            keyword_timeout_secs: default_keyword_timeout(),
            search_timeout_secs: default_search_timeout(),
            retrieval_timeout_secs: default_retrieval_timeout(),
            prompt_timeout_secs: default_prompt_timeout(),
            model_timeout_secs: default_model_timeout(),
            reference_timeout_secs: default_reference_timeout(),
            search_top_k: default_top_k(),
            retrieval_top_k: default_top_k(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON instead of human-readable lines
    #[serde(default)]
    pub json_format: bool,

    /// Optional file that receives a copy of every log line
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChapterflowError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChapterflowError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(db_path) = std::env::var("CHAPTERFLOW_DB") {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }

        if let Ok(max_history) = std::env::var("CHAPTERFLOW_MAX_HISTORY") {
            if let Ok(value) = max_history.parse() {
                self.storage.default_max_history = value;
            } else {
                tracing::warn!("Invalid CHAPTERFLOW_MAX_HISTORY: {}", max_history);
            }
        }

        if let Ok(max_sessions) = std::env::var("CHAPTERFLOW_MAX_SESSIONS") {
            if let Ok(value) = max_sessions.parse() {
                self.storage.max_sessions = value;
            } else {
                tracing::warn!("Invalid CHAPTERFLOW_MAX_SESSIONS: {}", max_sessions);
            }
        }

        if let Ok(busy) = std::env::var("CHAPTERFLOW_BUSY_TIMEOUT_MS") {
            if let Ok(value) = busy.parse() {
                self.storage.busy_timeout_ms = value;
            } else {
                tracing::warn!("Invalid CHAPTERFLOW_BUSY_TIMEOUT_MS: {}", busy);
            }
        }

        if let Ok(days) = std::env::var("CHAPTERFLOW_JOB_RETENTION_DAYS") {
            if let Ok(value) = days.parse() {
                self.generation.job_retention_days = value;
            } else {
                tracing::warn!("Invalid CHAPTERFLOW_JOB_RETENTION_DAYS: {}", days);
            }
        }

        if let Ok(staleness) = std::env::var("CHAPTERFLOW_CACHE_STALENESS_SECS") {
            if let Ok(value) = staleness.parse() {
                self.cache.staleness_secs = value;
            } else {
                tracing::warn!("Invalid CHAPTERFLOW_CACHE_STALENESS_SECS: {}", staleness);
            }
        }

        if let Ok(level) = std::env::var("CHAPTERFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json_logs) = std::env::var("CHAPTERFLOW_JSON_LOGS") {
            match json_logs.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.logging.json_format = true,
                "0" | "false" | "no" => self.logging.json_format = false,
                other => tracing::warn!("Invalid CHAPTERFLOW_JSON_LOGS: {}", other),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(db_path) = &cli.db_path {
            self.storage.db_path = Some(db_path.clone());
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.storage.busy_timeout_ms == 0 {
            return Err(ChapterflowError::Config(
                "storage.busy_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.default_max_history == 0 {
            return Err(ChapterflowError::Config(
                "storage.default_max_history must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.max_sessions == 0 {
            return Err(ChapterflowError::Config(
                "storage.max_sessions must be greater than 0".to_string(),
            )
            .into());
        }

        if self.generation.job_retention_days == 0 {
            return Err(ChapterflowError::Config(
                "generation.job_retention_days must be greater than 0".to_string(),
            )
            .into());
        }

        let deadlines = [
            ("keyword_timeout_secs", self.generation.keyword_timeout_secs),
            ("search_timeout_secs", self.generation.search_timeout_secs),
            (
                "retrieval_timeout_secs",
                self.generation.retrieval_timeout_secs,
            ),
            ("prompt_timeout_secs", self.generation.prompt_timeout_secs),
            ("model_timeout_secs", self.generation.model_timeout_secs),
            (
                "reference_timeout_secs",
                self.generation.reference_timeout_secs,
            ),
        ];
        for (name, value) in deadlines {
            if value == 0 {
                return Err(ChapterflowError::Config(format!(
                    "generation.{} must be greater than 0",
                    name
                ))
                .into());
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ChapterflowError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ))
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.default_max_history, 30);
        assert_eq!(config.storage.max_sessions, 100);
        assert_eq!(config.generation.job_retention_days, 7);
        assert_eq!(config.generation.model_timeout_secs, 180);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_config_validation_success() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_max_history() {
        let mut config = Config::default();
        config.storage.default_max_history = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_deadline() {
        let mut config = Config::default();
        config.generation.search_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("search_timeout_secs"));
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
storage:
  db_path: /tmp/chapterflow-test.db
  default_max_history: 5
cache:
  staleness_secs: 2
generation:
  model_timeout_secs: 90
logging:
  level: debug
  json_format: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.storage.db_path,
            Some(PathBuf::from("/tmp/chapterflow-test.db"))
        );
        assert_eq!(config.storage.default_max_history, 5);
        assert_eq!(config.storage.max_sessions, 100);
        assert_eq!(config.cache.staleness_secs, 2);
        assert_eq!(config.generation.model_timeout_secs, 90);
        assert_eq!(config.generation.search_timeout_secs, 60);
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_load_nonexistent_file_uses_defaults() {
        let cli = crate::cli::Cli::default();
        let config = Config::load("/nonexistent/chapterflow.yaml", &cli).unwrap();
        assert_eq!(config.storage.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_cli_db_override_wins() {
        let cli = crate::cli::Cli {
            db_path: Some(PathBuf::from("/tmp/override.db")),
            verbose: true,
            ..Default::default()
        };
        let mut config = Config::default();
        config.apply_cli_overrides(&cli);
        assert_eq!(config.storage.db_path, Some(PathBuf::from("/tmp/override.db")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_overrides_storage() {
        std::env::set_var("CHAPTERFLOW_MAX_HISTORY", "12");
        std::env::set_var("CHAPTERFLOW_JSON_LOGS", "true");
        std::env::set_var("CHAPTERFLOW_MAX_SESSIONS", "not-a-number");

        let mut config = Config::default();
        config.apply_env_vars();

        assert_eq!(config.storage.default_max_history, 12);
        assert!(config.logging.json_format);
        assert_eq!(config.storage.max_sessions, 100);

        std::env::remove_var("CHAPTERFLOW_MAX_HISTORY");
        std::env::remove_var("CHAPTERFLOW_JSON_LOGS");
        std::env::remove_var("CHAPTERFLOW_MAX_SESSIONS");
    }
}
