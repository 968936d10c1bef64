//! Queue and worker configuration.
//!
//! Values come from `QUOTECASH_JOBS_*` environment variables with sensible
//! defaults:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `QUOTECASH_JOBS_LEASE_TIMEOUT_MS` | 300000 |
//! | `QUOTECASH_JOBS_HANDLER_TIMEOUT_MS` | 120000 |
//! | `QUOTECASH_JOBS_POLL_INTERVAL_MS` | 500 |
//! | `QUOTECASH_JOBS_MAX_IDLE_INTERVAL_MS` | 10000 |
//! | `QUOTECASH_JOBS_BATCH_SIZE` | 10 |
//! | `QUOTECASH_JOBS_WORKERS` | 4 |
//! | `QUOTECASH_JOBS_MAX_ATTEMPTS` | 5 |
//! | `QUOTECASH_JOBS_RETRY_BASE_MS` | 2000 |
//! | `QUOTECASH_JOBS_RETRY_MAX_MS` | 900000 |
//! | `QUOTECASH_JOBS_RETRY_JITTER` | 0.2 |
//! | `QUOTECASH_JOBS_RATE_LIMIT_FLOOR_MS` | 60000 |
//! | `QUOTECASH_JOBS_RETRY_AFTER_MAX_MS` | 86400000 |
//!
//! Retry delays are bounded by [`MAX_RETRY_DELAY`] (seven days).

use std::str::FromStr;
use std::time::Duration;

use quotecash_core::{TenantId, TenantScoped};

use crate::retry::{MAX_RETRY_DELAY, RetryPolicy};
use crate::types::{Job, JobCategory};

const PREFIX: &str = "QUOTECASH_JOBS_";

/// Error types for configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Queue-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// A processing job whose lease is older than this can be reclaimed.
    pub lease_timeout: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
    /// Idle sleep doubles up to this bound while the queue stays empty.
    pub max_idle_interval: Duration,
    /// Jobs leased per claim.
    pub batch_size: usize,
    /// Poll loops per worker pool.
    pub workers: usize,
    /// Attempt budget for jobs enqueued without one.
    pub default_max_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            max_idle_interval: Duration::from_secs(10),
            batch_size: 10,
            workers: 4,
            default_max_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (full variable names).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let mut config = Self::default();

        if let Some((k, v)) = get("LEASE_TIMEOUT_MS") {
            config.lease_timeout = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("HANDLER_TIMEOUT_MS") {
            config.handler_timeout = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_IDLE_INTERVAL_MS") {
            config.max_idle_interval = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("BATCH_SIZE") {
            config.batch_size = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("WORKERS") {
            config.workers = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_ATTEMPTS") {
            config.default_max_attempts = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_BASE_MS") {
            config.retry.base_delay = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_MAX_MS") {
            config.retry.max_delay = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_JITTER") {
            config.retry.jitter_ratio = parse(&k, &v)?;
        }
        if let Some((k, v)) = get("RATE_LIMIT_FLOOR_MS") {
            config.retry.rate_limit_floor = parse_millis(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_AFTER_MAX_MS") {
            config.retry.max_retry_after = parse_millis(&k, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be > 0".into()));
        }
        if self.lease_timeout <= self.handler_timeout {
            return Err(ConfigError::Invalid(
                "lease_timeout must exceed handler_timeout".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be > 0".into()));
        }
        if self.max_idle_interval < self.poll_interval {
            return Err(ConfigError::Invalid(
                "max_idle_interval must be >= poll_interval".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("default_max_attempts must be > 0".into()));
        }
        if self.retry.base_delay.is_zero() || self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid(
                "retry delays must satisfy 0 < base_delay <= max_delay".into(),
            ));
        }
        let longest = self
            .retry
            .max_delay
            .max(self.retry.rate_limit_floor)
            .max(self.retry.max_retry_after);
        if longest > MAX_RETRY_DELAY {
            return Err(ConfigError::Invalid(format!(
                "retry delays must not exceed {}s",
                MAX_RETRY_DELAY.as_secs()
            )));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err(ConfigError::Invalid("retry jitter must be in [0, 1)".into()));
        }
        Ok(())
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging; poll loops are named `{name}-{index}`
    pub name: String,
    /// Optional tenant filter
    pub tenant_id: Option<TenantId>,
    /// Optional category filter (all categories when empty)
    pub categories: Vec<JobCategory>,
    /// Number of poll loops
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_idle_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

impl WorkerConfig {
    /// Take sizes and intervals from the queue configuration.
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            name: "job-worker".to_string(),
            tenant_id: None,
            categories: Vec::new(),
            workers: config.workers,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            max_idle_interval: config.max_idle_interval,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = JobCategory>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_idle_interval(mut self, max_idle_interval: Duration) -> Self {
        self.max_idle_interval = max_idle_interval;
        self
    }

    /// Whether a pool with this configuration may run `job`.
    ///
    /// The claim query already filters by tenant; this re-checks what the store
    /// handed back.
    pub fn accepts(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|tenant_id| job.belongs_to(tenant_id))
    }
}
