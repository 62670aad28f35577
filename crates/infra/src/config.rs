//! Queue configuration.
//!
//! Configuration is an explicit value handed to each component at
//! construction; nothing reads process-wide mutable state after startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ispadmin_provisioning::RetryPolicy;

/// Settings shared by the store, dispatcher, registry and reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    /// `max_retries` for enqueue requests that omit it
    pub default_max_retries: u32,
    /// A worker silent for longer than this is considered crashed
    pub heartbeat_timeout: Duration,
    /// How often the reaper sweeps
    pub reap_interval: Duration,
    /// Upper bound on `list` page size
    pub max_page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let heartbeat_timeout = Duration::from_secs(90);
        Self {
            retry: RetryPolicy::default(),
            default_max_retries: 3,
            heartbeat_timeout,
            reap_interval: heartbeat_timeout / 2,
            max_page_size: 100,
        }
    }
}

/// A configuration value could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl QueueConfig {
    pub const RETRY_BASE_SECS: &'static str = "ISPADMIN_RETRY_BASE_SECS";
    pub const RETRY_MULTIPLIER: &'static str = "ISPADMIN_RETRY_MULTIPLIER";
    pub const RETRY_CAP_SECS: &'static str = "ISPADMIN_RETRY_CAP_SECS";
    pub const RETRY_JITTER: &'static str = "ISPADMIN_RETRY_JITTER";
    pub const DEFAULT_MAX_RETRIES: &'static str = "ISPADMIN_DEFAULT_MAX_RETRIES";
    pub const HEARTBEAT_TIMEOUT_SECS: &'static str = "ISPADMIN_HEARTBEAT_TIMEOUT_SECS";
    pub const REAP_INTERVAL_SECS: &'static str = "ISPADMIN_REAP_INTERVAL_SECS";
    pub const MAX_PAGE_SIZE: &'static str = "ISPADMIN_MAX_PAGE_SIZE";

    /// Load from process environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test map, ...).
    ///
    /// When the heartbeat timeout is overridden but the reap interval is not,
    /// the interval follows as `timeout / 2`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, Self::RETRY_BASE_SECS)? {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(m) = parse::<u32>(&lookup, Self::RETRY_MULTIPLIER)? {
            config.retry.multiplier = m;
        }
        if let Some(secs) = parse::<u64>(&lookup, Self::RETRY_CAP_SECS)? {
            config.retry.max_delay = Duration::from_secs(secs);
        }
        if let Some(j) = parse::<f64>(&lookup, Self::RETRY_JITTER)? {
            config.retry.jitter = j;
        }
        if let Some(n) = parse::<u32>(&lookup, Self::DEFAULT_MAX_RETRIES)? {
            config.default_max_retries = n;
        }
        if let Some(secs) = parse::<u64>(&lookup, Self::HEARTBEAT_TIMEOUT_SECS)? {
            config.heartbeat_timeout = Duration::from_secs(secs);
            config.reap_interval = config.heartbeat_timeout / 2;
        }
        if let Some(secs) = parse::<u64>(&lookup, Self::REAP_INTERVAL_SECS)? {
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse::<usize>(&lookup, Self::MAX_PAGE_SIZE)? {
            config.max_page_size = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate().map_err(|e| ConfigError {
            key: "retry".to_string(),
            value: format!("{:?}", self.retry),
            reason: e.to_string(),
        })?;
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError {
                key: Self::HEARTBEAT_TIMEOUT_SECS.to_string(),
                value: "0".to_string(),
                reason: "heartbeat timeout must be positive".to_string(),
            });
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError {
                key: Self::REAP_INTERVAL_SECS.to_string(),
                value: "0".to_string(),
                reason: "reap interval must be positive".to_string(),
            });
        }
        if self.default_max_retries > i32::MAX as u32 {
            return Err(ConfigError {
                key: Self::DEFAULT_MAX_RETRIES.to_string(),
                value: self.default_max_retries.to_string(),
                reason: "max retries must fit a 32-bit signed integer".to_string(),
            });
        }
        if self.max_page_size == 0 {
            return Err(ConfigError {
                key: Self::MAX_PAGE_SIZE.to_string(),
                value: "0".to_string(),
                reason: "page size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_policy() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.retry.base_delay, Duration::from_secs(30));
        assert_eq!(config.retry.max_delay, Duration::from_secs(3600));
        assert_eq!(config.reap_interval, config.heartbeat_timeout / 2);
    }

    #[test]
    fn overrides_are_applied() {
        let config = QueueConfig::from_lookup(lookup(&[
            (QueueConfig::RETRY_BASE_SECS, "10"),
            (QueueConfig::HEARTBEAT_TIMEOUT_SECS, "40"),
            (QueueConfig::DEFAULT_MAX_RETRIES, "7"),
        ]))
        .unwrap();

        assert_eq!(config.retry.base_delay, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(40));
        assert_eq!(config.reap_interval, Duration::from_secs(20));
        assert_eq!(config.default_max_retries, 7);
    }

    #[test]
    fn garbage_values_are_reported_with_their_key() {
        let err = QueueConfig::from_lookup(lookup(&[(QueueConfig::RETRY_MULTIPLIER, "two")]))
            .unwrap_err();
        assert_eq!(err.key, QueueConfig::RETRY_MULTIPLIER);

        let err = QueueConfig::from_lookup(lookup(&[(QueueConfig::HEARTBEAT_TIMEOUT_SECS, "0")]))
            .unwrap_err();
        assert_eq!(err.key, QueueConfig::HEARTBEAT_TIMEOUT_SECS);
    }

    #[test]
    fn default_max_retries_is_capped_at_the_column_range() {
        let err = QueueConfig::from_lookup(lookup(&[(QueueConfig::DEFAULT_MAX_RETRIES, "2147483648")]))
            .unwrap_err();
        assert_eq!(err.key, QueueConfig::DEFAULT_MAX_RETRIES);

        let config =
            QueueConfig::from_lookup(lookup(&[(QueueConfig::DEFAULT_MAX_RETRIES, "2147483647")])).unwrap();
        assert_eq!(config.default_max_retries, i32::MAX as u32);
    }
}
