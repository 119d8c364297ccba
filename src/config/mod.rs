//! Configuration loading for the sheet sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SHEETSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SHEETSYNC_";

/// Application configuration derived from `SHEETSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Database the jobs read their source tables from. Unset means `database_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_database_url: Option<String>,
    /// WeCom group robot webhook. Unset means notifications are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_webhook_url: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduling loop sleeps between evaluations.
    ///
    /// Environment variable: `SHEETSYNC_SCHEDULER_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Fixed UTC offset in which cron fields are evaluated.
    ///
    /// Environment variable: `SHEETSYNC_SCHEDULER_UTC_OFFSET_MINUTES`
    #[serde(default = "default_scheduler_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

/// Retry, timeout and logging limits applied by the sync executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ExecutorSettings {
    /// Base retry delay in milliseconds (default: 500)
    ///
    /// Retries use exponential backoff: base_backoff_ms * 2^attempt, capped at
    /// `max_backoff_ms`.
    ///
    /// Environment variable: `SHEETSYNC_EXECUTOR_BASE_BACKOFF_MS`
    #[serde(default = "default_executor_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Environment variable: `SHEETSYNC_EXECUTOR_MAX_BACKOFF_MS`
    #[serde(default = "default_executor_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Fraction of the backoff added as random jitter (0.0-1.0).
    ///
    /// Environment variable: `SHEETSYNC_EXECUTOR_JITTER_FACTOR`
    #[serde(default = "default_executor_jitter_factor")]
    pub jitter_factor: f64,

    /// Run timeout used when a job does not configure its own.
    ///
    /// Environment variable: `SHEETSYNC_EXECUTOR_DEFAULT_SYNC_TIMEOUT_SECONDS`
    #[serde(default = "default_executor_default_sync_timeout_seconds")]
    pub default_sync_timeout_seconds: u64,

    /// Environment variable: `SHEETSYNC_EXECUTOR_MAX_VALIDATION_ERRORS`
    #[serde(default = "default_executor_max_validation_errors")]
    pub max_validation_errors: usize,

    /// Environment variable: `SHEETSYNC_EXECUTOR_NOTIFY_TIMEOUT_SECONDS`
    #[serde(default = "default_executor_notify_timeout_seconds")]
    pub notify_timeout_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            source_database_url: None,
            notify_webhook_url: None,
            scheduler: SchedulerConfig::default(),
            executor: ExecutorSettings::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            utc_offset_minutes: default_scheduler_utc_offset_minutes(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_executor_base_backoff_ms(),
            max_backoff_ms: default_executor_max_backoff_ms(),
            jitter_factor: default_executor_jitter_factor(),
            default_sync_timeout_seconds: default_executor_default_sync_timeout_seconds(),
            max_validation_errors: default_executor_max_validation_errors(),
            notify_timeout_seconds: default_executor_notify_timeout_seconds(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 1 || self.tick_interval_seconds > 60 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        // UTC-12:00 .. UTC+14:00
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(ConfigError::InvalidSchedulerUtcOffset {
                value: self.utc_offset_minutes,
            });
        }

        Ok(())
    }
}

impl ExecutorSettings {
    /// Validate executor retry and timeout bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.base_backoff_ms,
                max: self.max_backoff_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitterFactor {
                value: self.jitter_factor,
            });
        }

        if self.default_sync_timeout_seconds == 0 {
            return Err(ConfigError::InvalidSyncTimeout {
                value: self.default_sync_timeout_seconds,
            });
        }

        if self.notify_timeout_seconds == 0 {
            return Err(ConfigError::InvalidNotifyTimeout {
                value: self.notify_timeout_seconds,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        // The robot webhook URL embeds its access key
        if config.notify_webhook_url.is_some() {
            config.notify_webhook_url = Some("[REDACTED]".to_string());
        }
        if config.source_database_url.is_some() {
            config.source_database_url = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Database URL for source reads.
    pub fn source_database_url(&self) -> &str {
        self.source_database_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }

    /// Validates the configuration, returning the first out-of-range setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if let Some(url) = &self.notify_webhook_url {
            url::Url::parse(url).map_err(|e| ConfigError::InvalidNotifyWebhookUrl {
                error: e.to_string(),
            })?;
        }

        self.scheduler.validate()?;
        self.executor.validate()?;

        Ok(())
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://sheetsync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    15
}

fn default_scheduler_utc_offset_minutes() -> i32 {
    0
}

fn default_executor_base_backoff_ms() -> u64 {
    500
}

fn default_executor_max_backoff_ms() -> u64 {
    30_000
}

fn default_executor_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_executor_default_sync_timeout_seconds() -> u64 {
    1800 // 30 minutes
}

fn default_executor_max_validation_errors() -> usize {
    200
}

fn default_executor_notify_timeout_seconds() -> u64 {
    10
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("database url is missing; set SHEETSYNC_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("database max connections must be at least 1, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("notify webhook url is invalid: {error}")]
    InvalidNotifyWebhookUrl { error: String },
    #[error("scheduler tick interval must be between 1 and 60 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("scheduler utc offset must be between -720 and 840 minutes, got {value}")]
    InvalidSchedulerUtcOffset { value: i32 },
    #[error("executor base backoff ({base}ms) cannot be greater than max backoff ({max}ms)")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error("executor jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidJitterFactor { value: f64 },
    #[error("executor default sync timeout must be positive, got {value}")]
    InvalidSyncTimeout { value: u64 },
    #[error("executor notify timeout must be positive, got {value}")]
    InvalidNotifyTimeout { value: u64 },
}

/// Loads configuration using layered `.env` files and `SHEETSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local` and
    /// then the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let source_database_url = layered
            .remove("SOURCE_DATABASE_URL")
            .and_then(non_empty);
        let notify_webhook_url = layered.remove("NOTIFY_WEBHOOK_URL").and_then(non_empty);

        let scheduler = SchedulerConfig {
            tick_interval_seconds: layered
                .remove("SCHEDULER_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_tick_interval_seconds),
            utc_offset_minutes: layered
                .remove("SCHEDULER_UTC_OFFSET_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_utc_offset_minutes),
        };

        let executor = ExecutorSettings {
            base_backoff_ms: layered
                .remove("EXECUTOR_BASE_BACKOFF_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_base_backoff_ms),
            max_backoff_ms: layered
                .remove("EXECUTOR_MAX_BACKOFF_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_max_backoff_ms),
            jitter_factor: layered
                .remove("EXECUTOR_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_jitter_factor),
            default_sync_timeout_seconds: layered
                .remove("EXECUTOR_DEFAULT_SYNC_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_default_sync_timeout_seconds),
            max_validation_errors: layered
                .remove("EXECUTOR_MAX_VALIDATION_ERRORS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_max_validation_errors),
            notify_timeout_seconds: layered
                .remove("EXECUTOR_NOTIFY_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_executor_notify_timeout_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            source_database_url,
            notify_webhook_url,
            scheduler,
            executor,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
