//! Runtime Configuration
//!
//! Configuration for the runtime's executors, fairness budget, and
//! logging. Settings can be built programmatically or loaded from
//! environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `FIBRA_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FIBRA_NUM_WORKERS` | Worker threads in the main pool | CPU count |
//! | `FIBRA_YIELD_OP_COUNT` | Per-fiber op budget before a forced yield | 2048 |
//! | `FIBRA_BLOCKING_KEEP_ALIVE_MS` | Idle blocking-thread retirement, ms | 60000 |
//! | `FIBRA_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `FIBRA_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use fibra::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .yield_op_count(512)
//!     .build()
//!     .unwrap();
//! ```

use std::env;
use std::fmt;
use std::time::Duration;

use crate::log::{LogFormat, LogLevel};

/// Default per-fiber op budget before a forced yield.
pub const DEFAULT_YIELD_OP_COUNT: usize = 2048;

/// Default idle retirement of blocking-pool threads.
pub const DEFAULT_BLOCKING_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Number of worker threads in the main pool.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Per-fiber op budget before a forced yield.
    /// Default: 2048.
    pub yield_op_count: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            yield_op_count: DEFAULT_YIELD_OP_COUNT,
        }
    }
}

/// Blocking-pool configuration.
#[derive(Debug, Clone)]
pub struct BlockingSettings {
    /// How long an idle blocking thread waits before retiring.
    pub keep_alive: Duration,
}

impl Default for BlockingSettings {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_BLOCKING_KEEP_ALIVE,
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Blocking-pool settings.
    pub blocking: BlockingSettings,
    /// Minimum log level.
    pub log_level: LogLevel,
    /// Log output format.
    pub log_format: LogFormat,
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `FIBRA_*` environment variables,
    /// falling back to defaults for missing or unparseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = read_env_parsed::<usize>("FIBRA_NUM_WORKERS") {
            if n >= 1 {
                config.scheduler.num_workers = n;
            }
        }
        if let Some(n) = read_env_parsed::<usize>("FIBRA_YIELD_OP_COUNT") {
            if n >= 1 {
                config.scheduler.yield_op_count = n;
            }
        }
        if let Some(ms) = read_env_parsed::<u64>("FIBRA_BLOCKING_KEEP_ALIVE_MS") {
            config.blocking.keep_alive = Duration::from_millis(ms);
        }
        if let Ok(s) = env::var("FIBRA_LOG_LEVEL") {
            match LogLevel::parse(&s) {
                Some(level) => config.log_level = level,
                None => crate::warn!("unrecognized FIBRA_LOG_LEVEL {:?}, using default", s),
            }
        }
        if let Ok(s) = env::var("FIBRA_LOG_FORMAT") {
            match LogFormat::parse(&s) {
                Some(format) => config.log_format = format,
                None => crate::warn!("unrecognized FIBRA_LOG_FORMAT {:?}, using default", s),
            }
        }

        config
    }

    /// Apply the logging settings globally.
    pub fn apply_logging(&self) {
        crate::log::set_level(self.log_level);
        crate::log::set_format(self.log_format);
    }
}

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            crate::warn!("unparseable {} value {:?}, using default", name, raw);
            None
        }
    }
}

/// Get the number of CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Error returned by [`RuntimeConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `num_workers` must be at least 1.
    ZeroWorkers,
    /// `yield_op_count` must be at least 1.
    ZeroYieldOpCount,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroWorkers => write!(f, "num_workers must be at least 1"),
            ConfigError::ZeroYieldOpCount => write!(f, "yield_op_count must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the per-fiber op budget.
    pub fn yield_op_count(mut self, n: usize) -> Self {
        self.config.scheduler.yield_op_count = n;
        self
    }

    /// Set the blocking-thread keep-alive.
    pub fn blocking_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.blocking.keep_alive = keep_alive;
        self
    }

    /// Set the minimum log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Set the log output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        if self.config.scheduler.num_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.config.scheduler.yield_op_count == 0 {
            return Err(ConfigError::ZeroYieldOpCount);
        }
        Ok(self.config)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.yield_op_count, DEFAULT_YIELD_OP_COUNT);
        assert_eq!(config.blocking.keep_alive, DEFAULT_BLOCKING_KEEP_ALIVE);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .yield_op_count(512)
            .blocking_keep_alive(Duration::from_secs(5))
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.yield_op_count, 512);
        assert_eq!(config.blocking.keep_alive, Duration::from_secs(5));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(
            RuntimeConfig::builder().num_workers(0).build().unwrap_err(),
            ConfigError::ZeroWorkers
        );
        assert_eq!(
            RuntimeConfig::builder()
                .yield_op_count(0)
                .build()
                .unwrap_err(),
            ConfigError::ZeroYieldOpCount
        );
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::ZeroWorkers.to_string(),
            "num_workers must be at least 1"
        );
    }
}
