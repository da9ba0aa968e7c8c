//! Configuration management for the PostgreSQL backend.

use kindstore_engine::{CounterConfig, EngineConfig, RetryPolicy};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Backend configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Shards given to a new counter
    pub counter_shards: u32,
    /// Lifetime of a cached counter total
    pub counter_cache_ttl: Duration,
    /// Attempts per transactional write, including the first
    pub tx_max_attempts: u32,
    /// Deadline for one engine operation
    pub op_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// when it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        let counter_defaults = CounterConfig::default();

        Ok(Self {
            database_url,
            max_connections: parse_var(&lookup, "MAX_CONNECTIONS")?.unwrap_or(10),
            counter_shards: parse_var(&lookup, "COUNTER_SHARDS")?
                .unwrap_or(counter_defaults.default_shards),
            counter_cache_ttl: parse_var(&lookup, "COUNTER_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(counter_defaults.cache_ttl),
            tx_max_attempts: parse_var(&lookup, "TX_MAX_ATTEMPTS")?
                .unwrap_or(RetryPolicy::default().max_attempts),
            op_timeout: parse_var(&lookup, "OP_TIMEOUT_MS")?.map(Duration::from_millis),
        })
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: self.tx_max_attempts,
                ..RetryPolicy::default()
            },
            op_timeout: self.op_timeout,
            counter: CounterConfig {
                default_shards: self.counter_shards,
                cache_ttl: self.counter_cache_ttl,
            },
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },
}
