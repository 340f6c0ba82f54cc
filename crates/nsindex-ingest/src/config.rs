//! Service configuration loaded from environment variables.

use crate::consumer::ConsumerConfig;
use crate::retry::RetryPolicy;
use crate::sweeper::SweeperConfig;
use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Routes must start with `<route_prefix>.` to be indexed.
    pub route_prefix: String,

    /// Directory holding one RocksDB database per table.
    pub data_dir: PathBuf,

    /// Namespace table name (and directory under `data_dir`).
    pub namespace_table: String,

    /// Indexed task table name (and directory under `data_dir`).
    pub indexed_task_table: String,

    /// Deliveries handled at once.
    pub concurrency: usize,

    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,

    /// Store attempts per write, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// How long in-flight deliveries may finish after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            route_prefix: nsindex_core::DEFAULT_ROUTE_PREFIX.to_string(),
            data_dir: PathBuf::from("./data"),
            namespace_table: "namespaces".to_string(),
            indexed_task_table: "indexed-tasks".to_string(),
            concurrency: 32,
            sweep_interval: Duration::from_secs(3600),
            sweep_batch_size: 1000,
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(5000),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All settings have defaults:
    /// - `NSINDEX_ROUTE_PREFIX` (default: "index")
    /// - `NSINDEX_DATA_DIR` (default: "./data")
    /// - `NSINDEX_NAMESPACE_TABLE` (default: "namespaces")
    /// - `NSINDEX_INDEXED_TASK_TABLE` (default: "indexed-tasks")
    /// - `NSINDEX_CONCURRENCY` (default: 32)
    /// - `NSINDEX_SWEEP_INTERVAL_SECS` (default: 3600)
    /// - `NSINDEX_SWEEP_BATCH_SIZE` (default: 1000)
    /// - `NSINDEX_RETRY_ATTEMPTS` (default: 5)
    /// - `NSINDEX_RETRY_BASE_MS` (default: 100)
    /// - `NSINDEX_RETRY_MAX_MS` (default: 5000)
    /// - `NSINDEX_SHUTDOWN_GRACE_SECS` (default: 30)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let route_prefix = env_string("NSINDEX_ROUTE_PREFIX", &defaults.route_prefix);
        let route_prefix = route_prefix.trim_end_matches('.').to_string();
        if route_prefix.is_empty() {
            return Err(Error::Config(
                "NSINDEX_ROUTE_PREFIX must not be empty".to_string(),
            ));
        }

        let namespace_table = env_string("NSINDEX_NAMESPACE_TABLE", &defaults.namespace_table);
        let indexed_task_table =
            env_string("NSINDEX_INDEXED_TASK_TABLE", &defaults.indexed_task_table);
        if namespace_table.is_empty() || indexed_task_table.is_empty() {
            return Err(Error::Config("table names must not be empty".to_string()));
        }
        if namespace_table == indexed_task_table {
            return Err(Error::Config(format!(
                "namespace and indexed task tables must differ (both '{namespace_table}')"
            )));
        }

        let retry_base_ms: u64 = env_parse("NSINDEX_RETRY_BASE_MS", 100)?;
        let retry_max_ms: u64 = env_parse("NSINDEX_RETRY_MAX_MS", 5000)?;
        if retry_max_ms < retry_base_ms {
            return Err(Error::Config(format!(
                "NSINDEX_RETRY_MAX_MS ({retry_max_ms}) is below \
                 NSINDEX_RETRY_BASE_MS ({retry_base_ms})"
            )));
        }

        let config = Self {
            route_prefix,
            data_dir: std::env::var("NSINDEX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            namespace_table,
            indexed_task_table,
            concurrency: env_positive("NSINDEX_CONCURRENCY", defaults.concurrency)?,
            sweep_interval: Duration::from_secs(env_positive("NSINDEX_SWEEP_INTERVAL_SECS", 3600)?),
            sweep_batch_size: env_positive("NSINDEX_SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
            retry_attempts: env_positive("NSINDEX_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            retry_max_delay: Duration::from_millis(retry_max_ms),
            shutdown_grace: Duration::from_secs(env_parse("NSINDEX_SHUTDOWN_GRACE_SECS", 30)?),
        };

        tracing::info!(
            route_prefix = %config.route_prefix,
            data_dir = %config.data_dir.display(),
            concurrency = config.concurrency,
            sweep_interval_secs = config.sweep_interval.as_secs(),
            retry_attempts = config.retry_attempts,
            "indexer configuration loaded"
        );

        Ok(config)
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            route_prefix: self.route_prefix.clone(),
            concurrency: self.concurrency,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            batch_size: self.sweep_batch_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_positive<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
{
    let value = env_parse(key, default)?;
    if value < T::from(1) {
        return Err(Error::Config(format!("{key} must be at least 1")));
    }
    Ok(value)
}
