//! Scheduler configuration.
//!
//! This module provides configuration for concurrency limits, the worker
//! pool, the API rate limiter, processing windows and failure isolation.
//! Configuration can be built in code, loaded from a YAML file, or read from
//! `FLEET_*` environment variables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::registry::ProcessingWindow;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers created at initialization.
    pub size: usize,
    /// Maximum time to wait for workers before a resource timeout.
    pub acquire_timeout_ms: u64,
    /// Sleep between availability scans while waiting for workers.
    pub poll_interval_ms: u64,
    /// Interval of the background connectivity scan.
    pub health_check_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            acquire_timeout_ms: 60_000,
            poll_interval_ms: 100,
            health_check_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// External API budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiRateLimitConfig {
    /// Nominal requests allowed per 60 second window.
    pub requests_per_minute: u64,
    /// Extra requests allowed per window beyond the nominal limit.
    pub burst_limit: u64,
}

impl Default for ApiRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_limit: 10,
        }
    }
}

/// Retry and quarantine policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureIsolationConfig {
    /// Number of retries before a store is dropped from the run.
    pub max_retries: usize,
    /// Growth factor used to extend the ladder past its last entry.
    pub backoff_multiplier: f64,
    /// Retry delays in milliseconds, indexed by previous attempt count.
    pub backoff_ladder_ms: Vec<u64>,
    /// Consecutive failures after which a store is quarantined.
    pub quarantine_threshold: u32,
    /// Quarantine a store as soon as it exhausts its retries.
    pub quarantine_on_retry_exhaustion: bool,
}

impl Default for FailureIsolationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 3.0,
            backoff_ladder_ms: vec![60_000, 300_000, 900_000],
            quarantine_threshold: 5,
            quarantine_on_retry_exhaustion: false,
        }
    }
}

impl FailureIsolationConfig {
    /// Effective retry ladder with exactly `max_retries` entries.
    ///
    /// The configured ladder is truncated when longer than `max_retries`
    /// and extended by repeatedly multiplying its last entry when shorter.
    pub fn retry_ladder(&self) -> Vec<Duration> {
        let mut ladder: Vec<u64> = self
            .backoff_ladder_ms
            .iter()
            .copied()
            .take(self.max_retries)
            .collect();

        let mut last = ladder.last().copied().unwrap_or(60_000);
        while ladder.len() < self.max_retries {
            last = (last as f64 * self.backoff_multiplier).round() as u64;
            ladder.push(last);
        }

        ladder.into_iter().map(Duration::from_millis).collect()
    }
}

/// Configuration for the orchestrator and its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of stores processed concurrently.
    pub max_concurrent_stores: usize,
    /// Workers requested per store unless its config overrides it.
    pub resource_units_per_store: usize,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// External API budget.
    pub api_rate_limit: ApiRateLimitConfig,
    /// Processing windows by store id, overriding the store's own window.
    pub processing_windows: HashMap<String, ProcessingWindow>,
    /// Retry and quarantine policy.
    pub failure_isolation: FailureIsolationConfig,
    /// Stop starting new stores after this long.
    pub run_timeout_ms: Option<u64>,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Rolling sample size for queue wait-time statistics.
    pub queue_stats_sample_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stores: 3,
            resource_units_per_store: 1,
            pool: PoolConfig::default(),
            api_rate_limit: ApiRateLimitConfig::default(),
            processing_windows: HashMap::new(),
            failure_isolation: FailureIsolationConfig::default(),
            run_timeout_ms: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            queue_stats_sample_size: 100,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FLEET_MAX_CONCURRENT_STORES`: Maximum concurrent stores (default: 3)
    /// - `FLEET_RESOURCE_UNITS_PER_STORE`: Workers per store (default: 1)
    /// - `FLEET_POOL_SIZE`: Worker pool size (default: 5)
    /// - `FLEET_ACQUIRE_TIMEOUT_MS`: Worker acquisition timeout (default: 60000)
    /// - `FLEET_HEALTH_CHECK_INTERVAL_MS`: Health check interval (default: 30000)
    /// - `FLEET_API_REQUESTS_PER_MINUTE`: Nominal API limit (default: 60)
    /// - `FLEET_API_BURST_LIMIT`: Burst allowance (default: 10)
    /// - `FLEET_MAX_RETRIES`: Retries per store (default: 3)
    /// - `FLEET_QUARANTINE_THRESHOLD`: Failures before quarantine (default: 5)
    /// - `FLEET_RUN_TIMEOUT_MS`: Optional run timeout
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FLEET_MAX_CONCURRENT_STORES") {
            config.max_concurrent_stores = parse_env_value(&val, "FLEET_MAX_CONCURRENT_STORES")?;
        }

        if let Ok(val) = std::env::var("FLEET_RESOURCE_UNITS_PER_STORE") {
            config.resource_units_per_store =
                parse_env_value(&val, "FLEET_RESOURCE_UNITS_PER_STORE")?;
        }

        // Pool settings
        if let Ok(val) = std::env::var("FLEET_POOL_SIZE") {
            config.pool.size = parse_env_value(&val, "FLEET_POOL_SIZE")?;
        }

        if let Ok(val) = std::env::var("FLEET_ACQUIRE_TIMEOUT_MS") {
            config.pool.acquire_timeout_ms = parse_env_value(&val, "FLEET_ACQUIRE_TIMEOUT_MS")?;
        }

        if let Ok(val) = std::env::var("FLEET_HEALTH_CHECK_INTERVAL_MS") {
            config.pool.health_check_interval_ms =
                parse_env_value(&val, "FLEET_HEALTH_CHECK_INTERVAL_MS")?;
        }

        // Rate limit settings
        if let Ok(val) = std::env::var("FLEET_API_REQUESTS_PER_MINUTE") {
            config.api_rate_limit.requests_per_minute =
                parse_env_value(&val, "FLEET_API_REQUESTS_PER_MINUTE")?;
        }

        if let Ok(val) = std::env::var("FLEET_API_BURST_LIMIT") {
            config.api_rate_limit.burst_limit = parse_env_value(&val, "FLEET_API_BURST_LIMIT")?;
        }

        // Failure isolation
        if let Ok(val) = std::env::var("FLEET_MAX_RETRIES") {
            config.failure_isolation.max_retries = parse_env_value(&val, "FLEET_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("FLEET_QUARANTINE_THRESHOLD") {
            config.failure_isolation.quarantine_threshold =
                parse_env_value(&val, "FLEET_QUARANTINE_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("FLEET_RUN_TIMEOUT_MS") {
            config.run_timeout_ms = Some(parse_env_value(&val, "FLEET_RUN_TIMEOUT_MS")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_stores == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_stores must be greater than 0".to_string(),
            ));
        }

        if self.resource_units_per_store == 0 {
            return Err(ConfigError::ValidationFailed(
                "resource_units_per_store must be greater than 0".to_string(),
            ));
        }

        if self.pool.size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.size must be greater than 0".to_string(),
            ));
        }

        if self.resource_units_per_store > self.pool.size {
            return Err(ConfigError::ValidationFailed(format!(
                "resource_units_per_store ({}) cannot exceed pool.size ({})",
                self.resource_units_per_store, self.pool.size
            )));
        }

        if self.pool.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.health_check_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.api_rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::ValidationFailed(
                "api_rate_limit.requests_per_minute must be greater than 0".to_string(),
            ));
        }

        if self.failure_isolation.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "failure_isolation.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.failure_isolation.quarantine_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "failure_isolation.quarantine_threshold must be greater than 0".to_string(),
            ));
        }

        for (store_id, window) in &self.processing_windows {
            window.validate().map_err(|reason| {
                ConfigError::ValidationFailed(format!(
                    "processing window for '{}': {}",
                    store_id, reason
                ))
            })?;
        }

        Ok(())
    }

    /// API quota requested by each store: the nominal limit split evenly
    /// across concurrent stores.
    pub fn api_quota_per_store(&self) -> u64 {
        self.api_rate_limit.requests_per_minute / self.max_concurrent_stores.max(1) as u64
    }

    /// Optional run timeout as a duration.
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Builder method to set max concurrent stores.
    pub fn with_max_concurrent_stores(mut self, max: usize) -> Self {
        self.max_concurrent_stores = max;
        self
    }

    /// Builder method to set workers per store.
    pub fn with_resource_units_per_store(mut self, units: usize) -> Self {
        self.resource_units_per_store = units;
        self
    }

    /// Builder method to set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.size = size;
        self
    }

    /// Builder method to set the worker acquisition timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method to set the worker poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.pool.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Builder method to set the API rate limit.
    pub fn with_api_rate_limit(mut self, requests_per_minute: u64, burst_limit: u64) -> Self {
        self.api_rate_limit = ApiRateLimitConfig {
            requests_per_minute,
            burst_limit,
        };
        self
    }

    /// Builder method to set the retry ladder; also sets `max_retries`.
    pub fn with_backoff_ladder(mut self, ladder: Vec<Duration>) -> Self {
        self.failure_isolation.max_retries = ladder.len();
        self.failure_isolation.backoff_ladder_ms =
            ladder.iter().map(|d| d.as_millis() as u64).collect();
        self
    }

    /// Builder method to set the quarantine threshold.
    pub fn with_quarantine_threshold(mut self, threshold: u32) -> Self {
        self.failure_isolation.quarantine_threshold = threshold;
        self
    }

    /// Builder method to quarantine stores that exhaust their retries.
    pub fn with_quarantine_on_retry_exhaustion(mut self, enabled: bool) -> Self {
        self.failure_isolation.quarantine_on_retry_exhaustion = enabled;
        self
    }

    /// Builder method to add a processing window override.
    pub fn with_processing_window(
        mut self,
        store_id: impl Into<String>,
        window: ProcessingWindow,
    ) -> Self {
        self.processing_windows.insert(store_id.into(), window);
        self
    }

    /// Builder method to set the run timeout.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Parses an environment variable value to the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_stores, 3);
        assert_eq!(config.resource_units_per_store, 1);
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(60));
        assert_eq!(config.pool.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.pool.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.api_rate_limit.requests_per_minute, 60);
        assert_eq!(config.api_rate_limit.burst_limit, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_retry_ladder() {
        let ladder = FailureIsolationConfig::default().retry_ladder();
        assert_eq!(
            ladder,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900)
            ]
        );
    }

    #[test]
    fn test_retry_ladder_truncates_and_extends() {
        let mut policy = FailureIsolationConfig {
            max_retries: 2,
            ..Default::default()
        };
        assert_eq!(policy.retry_ladder().len(), 2);

        policy.max_retries = 5;
        let ladder = policy.retry_ladder();
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder[3], Duration::from_secs(2700));
        assert_eq!(ladder[4], Duration::from_secs(8100));

        policy.max_retries = 0;
        assert!(policy.retry_ladder().is_empty());
    }

    #[test]
    fn test_api_quota_per_store() {
        let config = SchedulerConfig::default()
            .with_api_rate_limit(60, 10)
            .with_max_concurrent_stores(4);
        assert_eq!(config.api_quota_per_store(), 15);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(SchedulerConfig::default()
            .with_max_concurrent_stores(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_pool_size(1)
            .with_resource_units_per_store(2)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_quarantine_threshold(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_processing_window("s1", ProcessingWindow::new("09:00", "17:00").with_timezone("Mars/Base"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            r#"
max_concurrent_stores: 2
pool:
  size: 4
api_rate_limit:
  requests_per_minute: 120
  burst_limit: 20
processing_windows:
  store-1:
    start: "22:00"
    end: "06:00"
    timezone: "+01:00"
    days_of_week: [1, 2, 3, 4, 5]
failure_isolation:
  quarantine_threshold: 3
"#,
        )
        .unwrap();

        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_stores, 2);
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.poll_interval_ms, 100);
        assert_eq!(config.api_rate_limit.requests_per_minute, 120);
        assert_eq!(config.failure_isolation.quarantine_threshold, 3);
        assert_eq!(config.failure_isolation.max_retries, 3);
        let window = &config.processing_windows["store-1"];
        assert_eq!(window.timezone, "+01:00");
        assert_eq!(window.days_of_week.as_deref(), Some(&[1, 2, 3, 4, 5][..]));
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: usize = parse_env_value(" 8 ", "KEY").unwrap();
        assert_eq!(parsed, 8);

        let err = parse_env_value::<usize>("eight", "FLEET_POOL_SIZE").unwrap_err();
        assert!(err.to_string().contains("FLEET_POOL_SIZE"));
    }

    #[test]
    fn test_builder_backoff_ladder() {
        let config = SchedulerConfig::default()
            .with_backoff_ladder(vec![Duration::from_millis(10), Duration::from_millis(20)]);
        assert_eq!(config.failure_isolation.max_retries, 2);
        assert_eq!(
            config.failure_isolation.retry_ladder(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }
}
