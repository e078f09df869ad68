//! Indexer configuration.
//!
//! Defaults are suitable for a single process; every knob can be overridden
//! through `TOOLHUB_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Number of dispatcher lanes (one task each).
    pub lanes: usize,
    /// Bounded queue length per lane.
    pub lane_capacity: usize,
    /// How long `submit` waits for lane capacity before giving the event back.
    pub submit_timeout: Duration,
    /// Bound on a single search store attempt.
    pub handler_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long shutdown waits for lanes to drain.
    pub shutdown_deadline: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: usize,
    /// JSON-lines dead-letter file; in-memory when unset.
    pub dead_letter_path: Option<PathBuf>,
    /// Postgres dead-letter store; takes precedence over the file when set.
    pub database_url: Option<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            lane_capacity: 1024,
            submit_timeout: Duration::from_millis(250),
            handler_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            shutdown_deadline: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(300),
            reconcile_batch_size: 500,
            dead_letter_path: None,
            database_url: None,
        }
    }
}

impl IndexerConfig {
    /// Defaults overlaid with `TOOLHUB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse::<usize, _>(&lookup, "TOOLHUB_LANES")? {
            cfg.lanes = v;
        }
        if let Some(v) = parse::<usize, _>(&lookup, "TOOLHUB_LANE_CAPACITY")? {
            cfg.lane_capacity = v;
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_SUBMIT_TIMEOUT_MS")? {
            cfg.submit_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_HANDLER_TIMEOUT_MS")? {
            cfg.handler_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u32, _>(&lookup, "TOOLHUB_RETRY_MAX_ATTEMPTS")? {
            cfg.retry.max_attempts = v;
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_RETRY_BASE_DELAY_MS")? {
            cfg.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_RETRY_MAX_DELAY_MS")? {
            cfg.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_RETRY_MAX_ELAPSED_MS")? {
            cfg.retry.max_elapsed = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_SHUTDOWN_DEADLINE_MS")? {
            cfg.shutdown_deadline = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64, _>(&lookup, "TOOLHUB_RECONCILE_INTERVAL_SECS")? {
            cfg.reconcile_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse::<usize, _>(&lookup, "TOOLHUB_RECONCILE_BATCH_SIZE")? {
            cfg.reconcile_batch_size = v;
        }
        if let Some(v) = non_empty(&lookup, "TOOLHUB_DEAD_LETTER_PATH") {
            cfg.dead_letter_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty(&lookup, "TOOLHUB_DATABASE_URL") {
            cfg.database_url = Some(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 {
            return Err(ConfigError::Invalid("lanes must be at least 1".into()));
        }
        if self.lane_capacity == 0 {
            return Err(ConfigError::Invalid("lane_capacity must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be non-zero".into()));
        }
        if self.reconcile_batch_size == 0 {
            return Err(ConfigError::Invalid("reconcile_batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn non_empty<F>(lookup: &F, var: &'static str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, var) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}
