use crate::runtime::telemetry;
use std::env;
use std::fmt;
use std::time::Duration;

/// Matches the slot count the admin tool has always used for bulk actions.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;

pub const ENV_CONCURRENCY: &str = "BULKRUN_CONCURRENCY";
pub const ENV_ITEM_TIMEOUT_MS: &str = "BULKRUN_ITEM_TIMEOUT_MS";
pub const ENV_METRICS_INTERVAL_MS: &str = "BULKRUN_METRICS_INTERVAL_MS";

/// Caller contract violations detected before a run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    InvalidConcurrency { limit: i64 },
    InvalidTimeout { field: &'static str },
    InvalidSetting { key: &'static str, value: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerError::InvalidConcurrency { limit } => {
                write!(f, "concurrency_limit must be at least 1 (got {limit})")
            }
            RunnerError::InvalidTimeout { field } => {
                write!(f, "{field} must be greater than 0")
            }
            RunnerError::InvalidSetting { key, value } => {
                write!(f, "{key} has an invalid value: {value:?}")
            }
        }
    }
}

impl std::error::Error for RunnerError {}

/// Runtime configuration for a [`crate::TaskRunner`].
///
/// Instances are only produced through [`RunnerConfig::builder`], [`RunnerConfig::new`]
/// or [`RunnerConfig::from_env`], all of which validate before returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    concurrency_limit: usize,
    item_timeout: Option<Duration>,
    metrics_interval: Duration,
}

pub struct RunnerConfigParams {
    pub concurrency_limit: usize,
    pub item_timeout: Option<Duration>,
    pub metrics_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            item_timeout: None,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    pub fn new(params: RunnerConfigParams) -> Result<Self, RunnerError> {
        let RunnerConfigParams {
            concurrency_limit,
            item_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            concurrency_limit,
            item_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads `BULKRUN_CONCURRENCY`, `BULKRUN_ITEM_TIMEOUT_MS` and
    /// `BULKRUN_METRICS_INTERVAL_MS`, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, RunnerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(raw) = lookup(ENV_CONCURRENCY) {
            let limit: i64 = parse_setting(ENV_CONCURRENCY, &raw)?;
            if limit < 1 {
                return Err(RunnerError::InvalidConcurrency { limit });
            }
            builder = builder.concurrency_limit(limit as usize);
        }

        if let Some(raw) = lookup(ENV_ITEM_TIMEOUT_MS) {
            let millis: u64 = parse_setting(ENV_ITEM_TIMEOUT_MS, &raw)?;
            if millis > 0 {
                builder = builder.item_timeout(Duration::from_millis(millis));
            }
        }

        if let Some(raw) = lookup(ENV_METRICS_INTERVAL_MS) {
            let millis: u64 = parse_setting(ENV_METRICS_INTERVAL_MS, &raw)?;
            builder = builder.metrics_interval(Duration::from_millis(millis));
        }

        builder.build()
    }

    /// Maximum number of items allowed in flight at once.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Per-item deadline; an item exceeding it is recorded as a failure.
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.concurrency_limit == 0 {
            return Err(RunnerError::InvalidConcurrency { limit: 0 });
        }

        if matches!(self.item_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(RunnerError::InvalidTimeout {
                field: "item_timeout",
            });
        }

        if self.metrics_interval.is_zero() {
            return Err(RunnerError::InvalidTimeout {
                field: "metrics_interval",
            });
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunnerConfigBuilder {
    concurrency_limit: Option<usize>,
    item_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl RunnerConfigBuilder {
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<RunnerConfig, RunnerError> {
        RunnerConfig::new(RunnerConfigParams {
            concurrency_limit: self.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT),
            item_timeout: self.item_timeout,
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        })
    }
}

fn parse_setting<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, RunnerError> {
    raw.trim()
        .parse()
        .map_err(|_| RunnerError::InvalidSetting {
            key,
            value: raw.to_owned(),
        })
}
