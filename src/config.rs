//! Engine configuration loaded from environment variables.

use std::time::Duration;

use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_COEFFICIENT};

/// History engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. Unset means the in-memory store.
    pub database_url: Option<String>,

    /// Max workflow execution contexts cached per shard.
    pub execution_cache_capacity: usize,

    /// Buffered history notifications per shard before slow subscribers
    /// start losing the oldest.
    pub notification_buffer_capacity: usize,

    /// Delay before the first persistence retry, in milliseconds.
    pub persistence_retry_initial_ms: u64,

    /// Ceiling for a single persistence retry delay, in milliseconds.
    pub persistence_retry_max_ms: u64,

    /// Total persistence retry budget, in milliseconds.
    pub persistence_retry_expiration_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            execution_cache_capacity: 512,
            notification_buffer_capacity: 128,
            persistence_retry_initial_ms: 50,
            persistence_retry_max_ms: 1_000,
            persistence_retry_expiration_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset. A variable that is set but
    /// unparseable is an error, not a silent default.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        fn parse_var<T: std::str::FromStr>(name: &str, fallback: T) -> anyhow::Result<T> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{name} must be an integer, got {raw:?}")),
                Err(_) => Ok(fallback),
            }
        }

        Ok(Self {
            database_url: std::env::var("BELAY_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok(),
            execution_cache_capacity: parse_var(
                "BELAY_EXECUTION_CACHE_CAPACITY",
                defaults.execution_cache_capacity,
            )?,
            notification_buffer_capacity: parse_var(
                "BELAY_NOTIFICATION_BUFFER",
                defaults.notification_buffer_capacity,
            )?,
            persistence_retry_initial_ms: parse_var(
                "BELAY_PERSISTENCE_RETRY_INITIAL_MS",
                defaults.persistence_retry_initial_ms,
            )?,
            persistence_retry_max_ms: parse_var(
                "BELAY_PERSISTENCE_RETRY_MAX_MS",
                defaults.persistence_retry_max_ms,
            )?,
            persistence_retry_expiration_ms: parse_var(
                "BELAY_PERSISTENCE_RETRY_EXPIRATION_MS",
                defaults.persistence_retry_expiration_ms,
            )?,
        })
    }

    pub fn persistence_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.persistence_retry_initial_ms),
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            max_interval: Duration::from_millis(self.persistence_retry_max_ms),
            expiration_interval: Duration::from_millis(self.persistence_retry_expiration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = Config::default().persistence_retry_policy();
        assert_eq!(policy.initial_interval, Duration::from_millis(50));
        assert_eq!(policy.max_interval, Duration::from_secs(1));
        assert_eq!(policy.expiration_interval, Duration::from_secs(30));
    }
}
