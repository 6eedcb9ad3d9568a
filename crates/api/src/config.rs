//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use checkout::{CheckoutConfig, ReaperConfig};
use thiserror::Error;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid {
                name: "LOG_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

/// A variable was set to something unparsable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL URL; the in-memory store is used when unset
/// - `CATALOG_FILE`: JSON catalog seed (offers and stock)
/// - `RESERVATION_TTL_SECS` (900), `SESSION_TTL_SECS` (1800)
/// - `REAPER_INTERVAL_SECS` (30), `REAPER_BATCH_SIZE` (100)
/// - `IDEMPOTENCY_WAIT_MS` (2000), `IDEMPOTENCY_LEASE_SECS` (60)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub catalog_file: Option<String>,
    pub reservation_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub reaper_batch_size: usize,
    pub idempotency_wait_ms: u64,
    pub idempotency_lease_secs: u64,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT", defaults.port)?,
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed("LOG_FORMAT", defaults.log_format)?,
            database_url: var("DATABASE_URL"),
            catalog_file: var("CATALOG_FILE"),
            reservation_ttl_secs: parsed("RESERVATION_TTL_SECS", defaults.reservation_ttl_secs)?,
            session_ttl_secs: parsed("SESSION_TTL_SECS", defaults.session_ttl_secs)?,
            reaper_interval_secs: parsed("REAPER_INTERVAL_SECS", defaults.reaper_interval_secs)?,
            reaper_batch_size: parsed("REAPER_BATCH_SIZE", defaults.reaper_batch_size)?,
            idempotency_wait_ms: parsed("IDEMPOTENCY_WAIT_MS", defaults.idempotency_wait_ms)?,
            idempotency_lease_secs: parsed(
                "IDEMPOTENCY_LEASE_SECS",
                defaults.idempotency_lease_secs,
            )?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine timing derived from this configuration.
    pub fn checkout(&self) -> CheckoutConfig {
        CheckoutConfig {
            reservation_ttl: chrono::Duration::seconds(self.reservation_ttl_secs as i64),
            session_ttl: chrono::Duration::seconds(self.session_ttl_secs as i64),
            idempotency_wait: StdDuration::from_millis(self.idempotency_wait_ms),
            idempotency_lease: chrono::Duration::seconds(self.idempotency_lease_secs as i64),
            ..CheckoutConfig::default()
        }
    }

    /// Reaper schedule derived from this configuration.
    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: StdDuration::from_secs(self.reaper_interval_secs),
            batch_size: self.reaper_batch_size.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            catalog_file: None,
            reservation_ttl_secs: 900,
            session_ttl_secs: 1800,
            reaper_interval_secs: 30,
            reaper_batch_size: 100,
            idempotency_wait_ms: 2000,
            idempotency_lease_secs: 60,
        }
    }
}
