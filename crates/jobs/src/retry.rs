//! Retry policy and the scheduler deciding between retry and dead-lettering.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_delta;
use crate::dead_letter::DeadLetterReason;
use crate::types::{ErrorClass, Job, JobId};

/// Longest delay a retry is ever scheduled out, whatever the policy or handler
/// hint says.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Backoff parameters shared by every job of a queue.
///
/// `max_attempts` is per job (set at enqueue time); the timing here is global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter)
    pub max_delay: Duration,
    /// Jitter ratio in `[0, 1)`; jitter is drawn from `[0, ratio * delay)`
    pub jitter_ratio: f64,
    /// Minimum delay for `rate_limited` failures
    pub rate_limit_floor: Duration,
    /// Cap on a handler-supplied `retry_after` hint
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15 * 60),
            jitter_ratio: 0.2,
            rate_limit_floor: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(24 * 3600),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_rate_limit_floor(mut self, floor: Duration) -> Self {
        self.rate_limit_floor = floor;
        self
    }

    pub fn with_max_retry_after(mut self, cap: Duration) -> Self {
        self.max_retry_after = cap;
        self
    }

    /// Delay before jitter for a given attempt number (1-indexed):
    /// `min(base * 2^(attempt-1), max_delay)`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Backoff including deterministic jitter derived from `(job_id, attempt)`.
    pub fn backoff(&self, job_id: JobId, attempt: u32) -> Duration {
        let delay = self.base_backoff(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * ratio * unit_jitter(job_id, attempt)) as u64;
        delay.saturating_add(Duration::from_millis(jitter_ms))
    }

    /// Delay for a failure of the given class.
    ///
    /// `rate_limited` never waits less than the configured floor, and a
    /// handler-supplied `retry_after` (capped at `max_retry_after`) is honored
    /// as an additional floor. The result never exceeds [`MAX_RETRY_DELAY`].
    pub fn delay_for(
        &self,
        job_id: JobId,
        attempt: u32,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) -> Duration {
        let mut delay = self.backoff(job_id, attempt);
        if class == ErrorClass::RateLimited {
            delay = delay.max(self.rate_limit_floor);
        }
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.max_retry_after));
        }
        delay.min(MAX_RETRY_DELAY)
    }
}

/// Deterministic value in `[0, 1)` for a job/attempt pair.
fn unit_jitter(job_id: JobId, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    // 53 bits fit exactly in an f64 mantissa.
    (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-admit the job at `next_retry_at`.
    Retry {
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Archive the job in the dead-letter queue.
    DeadLetter(DeadLetterReason),
}

/// Computes the next state of a job after a failed attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the fate of `job` after its current attempt failed with `class`.
    ///
    /// `job.attempt_count` already includes the failed attempt.
    pub fn decide(
        &self,
        job: &Job,
        class: ErrorClass,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !class.is_retriable() {
            return RetryDecision::DeadLetter(DeadLetterReason::NonRetryable);
        }
        if job.attempt_count >= job.max_attempts {
            return RetryDecision::DeadLetter(DeadLetterReason::ExhaustedRetries);
        }
        let delay = self
            .policy
            .delay_for(job.job_id, job.attempt_count, class, retry_after);
        let next_retry_at = now
            .checked_add_signed(to_delta(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry {
            next_retry_at,
            delay,
        }
    }
}
