//! # Core Configuration Module
//!
//! Provides configuration management for the export platform core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! holding every tunable of the export engines: job persistence, progress
//! retention, subscriber queue sizing, analytics aggregation and execution
//! limits. All values have defaults, and `build()` validates the result so a
//! misconfigured service fails at startup instead of at the first job.
//!
//! ## Usage
//!
//! ### Defaults
//!
//! ```
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder().build().unwrap();
//! assert!(config.database_url.is_none()); // in-memory SQLite
//! ```
//!
//! ### Custom Settings
//!
//! ```
//! use core_runtime::config::CoreConfig;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .database_url("sqlite:exports.db")
//!     .tracker_retention(Duration::from_secs(3600))
//!     .max_data_points(5_000)
//!     .execution_timeout(Some(Duration::from_secs(600)))
//!     .build()
//!     .unwrap();
//! ```
//!
//! ### Environment Overrides
//!
//! [`CoreConfig::from_env`] starts from the defaults and applies the
//! `EXPORT_*` variables listed on [`env`]. Unparsable values are reported as
//! [`Error::InvalidEnv`] rather than silently ignored.

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use std::time::Duration;

/// Environment variable names understood by [`CoreConfig::from_env`].
pub mod env {
    pub const DATABASE_URL: &str = "EXPORT_DATABASE_URL";
    pub const TRACKER_RETENTION_SECS: &str = "EXPORT_TRACKER_RETENTION_SECS";
    pub const AGGREGATION_PERIOD_SECS: &str = "EXPORT_AGGREGATION_PERIOD_SECS";
    pub const METRICS_RETENTION_SECS: &str = "EXPORT_METRICS_RETENTION_SECS";
    pub const MAX_DATA_POINTS: &str = "EXPORT_MAX_DATA_POINTS";
    /// `0` disables the execution timeout.
    pub const EXECUTION_TIMEOUT_SECS: &str = "EXPORT_EXECUTION_TIMEOUT_SECS";
}

const DEFAULT_TRACKER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 64;
const DEFAULT_AGGREGATION_PERIOD: Duration = Duration::from_secs(5 * 60);
const DEFAULT_METRICS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_DATA_POINTS: usize = 10_000;
const DEFAULT_REPORT_CACHE_SIZE: usize = 64;
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Core configuration for the export platform.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// SQLite connection URL for job persistence. `None` uses an in-memory database.
    pub database_url: Option<String>,

    /// Buffer size of the broadcast event bus
    pub event_buffer_size: usize,

    /// How long terminal progress sessions are kept before the retention loop drops them
    pub tracker_retention: Duration,

    /// Capacity of each progress/event subscriber queue
    pub subscriber_queue_capacity: usize,

    /// Interval of the analytics aggregation loop
    pub aggregation_period: Duration,

    /// How long raw samples and roll-ups are kept
    pub metrics_retention: Duration,

    /// Maximum raw samples kept per metric name
    pub max_data_points: usize,

    /// Number of generated reports kept in the report cache
    pub report_cache_size: usize,

    /// Upper bound on a single job execution. `None` disables the limit.
    pub execution_timeout: Option<Duration>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            tracker_retention: DEFAULT_TRACKER_RETENTION,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            aggregation_period: DEFAULT_AGGREGATION_PERIOD,
            metrics_retention: DEFAULT_METRICS_RETENTION,
            max_data_points: DEFAULT_MAX_DATA_POINTS,
            report_cache_size: DEFAULT_REPORT_CACHE_SIZE,
            execution_timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
        }
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder();
    /// ```
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Builds a configuration from the defaults overlaid with `EXPORT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed, or if the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(url) = lookup(env::DATABASE_URL) {
            builder = builder.database_url(url);
        }
        if let Some(secs) = parse_u64(&lookup, env::TRACKER_RETENTION_SECS)? {
            builder = builder.tracker_retention(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_u64(&lookup, env::AGGREGATION_PERIOD_SECS)? {
            builder = builder.aggregation_period(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_u64(&lookup, env::METRICS_RETENTION_SECS)? {
            builder = builder.metrics_retention(Duration::from_secs(secs));
        }
        if let Some(points) = parse_u64(&lookup, env::MAX_DATA_POINTS)? {
            builder = builder.max_data_points(points as usize);
        }
        if let Some(secs) = parse_u64(&lookup, env::EXECUTION_TIMEOUT_SECS)? {
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            builder = builder.execution_timeout(timeout);
        }

        builder.build()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - The database URL, when set, is not empty
    /// - Buffer and queue capacities are non-zero
    /// - Periods and retention windows are non-zero
    /// - The execution timeout, when set, is non-zero
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.database_url {
            if url.trim().is_empty() {
                return Err(Error::Config("Database URL cannot be empty".to_string()));
            }
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(Error::Config(
                "Subscriber queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.tracker_retention.is_zero() {
            return Err(Error::Config(
                "Tracker retention period must be greater than 0".to_string(),
            ));
        }

        if self.aggregation_period.is_zero() {
            return Err(Error::Config(
                "Aggregation period must be greater than 0".to_string(),
            ));
        }

        if self.metrics_retention.is_zero() {
            return Err(Error::Config(
                "Metrics retention period must be greater than 0".to_string(),
            ));
        }

        if self.max_data_points == 0 {
            return Err(Error::Config(
                "Max data points must be greater than 0".to_string(),
            ));
        }

        if self.report_cache_size == 0 {
            return Err(Error::Config(
                "Report cache size must be greater than 0".to_string(),
            ));
        }

        if matches!(self.execution_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(Error::Config(
                "Execution timeout must be greater than 0; use None to disable it".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|e| Error::InvalidEnv {
                key: key.to_string(),
                message: format!("'{}' is not a non-negative integer ({})", raw, e),
            })
        })
        .transpose()
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Every setter is optional; unset fields fall back to the defaults of
/// [`CoreConfig::default`]. [`build()`](CoreConfigBuilder::build) validates the
/// final configuration.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    database_url: Option<String>,
    event_buffer_size: Option<usize>,
    tracker_retention: Option<Duration>,
    subscriber_queue_capacity: Option<usize>,
    aggregation_period: Option<Duration>,
    metrics_retention: Option<Duration>,
    max_data_points: Option<usize>,
    report_cache_size: Option<usize>,
    execution_timeout: Option<Option<Duration>>,
}

impl CoreConfigBuilder {
    /// Sets the SQLite connection URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().database_url("sqlite:exports.db");
    /// ```
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the event bus buffer size.
    ///
    /// Default: 256 events
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets how long terminal progress sessions are retained.
    ///
    /// Default: 24 hours
    pub fn tracker_retention(mut self, retention: Duration) -> Self {
        self.tracker_retention = Some(retention);
        self
    }

    /// Sets the per-subscriber queue capacity.
    ///
    /// Default: 64 notifications
    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = Some(capacity);
        self
    }

    /// Sets the analytics aggregation interval.
    ///
    /// Default: 5 minutes
    pub fn aggregation_period(mut self, period: Duration) -> Self {
        self.aggregation_period = Some(period);
        self
    }

    /// Sets the metrics retention window.
    ///
    /// Default: 7 days
    pub fn metrics_retention(mut self, retention: Duration) -> Self {
        self.metrics_retention = Some(retention);
        self
    }

    /// Sets the maximum number of raw samples kept per metric.
    ///
    /// Default: 10 000
    pub fn max_data_points(mut self, points: usize) -> Self {
        self.max_data_points = Some(points);
        self
    }

    /// Sets the number of cached analytics reports.
    ///
    /// Default: 64
    pub fn report_cache_size(mut self, size: usize) -> Self {
        self.report_cache_size = Some(size);
        self
    }

    /// Sets the execution timeout. `None` disables it.
    ///
    /// Default: 1 hour
    pub fn execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Builds the final [`CoreConfig`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if any value fails [`CoreConfig::validate`].
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let err = CoreConfig::builder().max_data_points(0).build();
    /// assert!(err.is_err());
    /// ```
    pub fn build(self) -> Result<CoreConfig> {
        let defaults = CoreConfig::default();

        let config = CoreConfig {
            database_url: self.database_url.or(defaults.database_url),
            event_buffer_size: self.event_buffer_size.unwrap_or(defaults.event_buffer_size),
            tracker_retention: self.tracker_retention.unwrap_or(defaults.tracker_retention),
            subscriber_queue_capacity: self
                .subscriber_queue_capacity
                .unwrap_or(defaults.subscriber_queue_capacity),
            aggregation_period: self
                .aggregation_period
                .unwrap_or(defaults.aggregation_period),
            metrics_retention: self.metrics_retention.unwrap_or(defaults.metrics_retention),
            max_data_points: self.max_data_points.unwrap_or(defaults.max_data_points),
            report_cache_size: self.report_cache_size.unwrap_or(defaults.report_cache_size),
            execution_timeout: self
                .execution_timeout
                .unwrap_or(defaults.execution_timeout),
        };

        config.validate()?;

        Ok(config)
    }
}
