//! Core job types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quotecash_core::{CorrelationId, DomainError, DomainResult, TenantId, TenantScoped};

/// Maximum length (bytes) of an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
/// Maximum length (bytes) of a job type name.
pub const MAX_JOB_TYPE_LEN: usize = 128;
/// Highest (least urgent) priority value.
pub const MAX_PRIORITY: u8 = 9;
/// Priority used when the producer does not pick one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the worker holding a lease (e.g. `billing-worker-3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad family a job belongs to; workers can be restricted to categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    /// Inbound mail and document ingestion.
    Ingestion,
    /// Calendar and directory synchronization.
    Sync,
    /// Billing recurrence.
    Recurrence,
    /// Multi-step workflows fanning out other jobs.
    Orchestration,
    /// Document scanning and rendering.
    Documents,
    /// Notification and webhook dispatch.
    Notifications,
    /// Data exports.
    Export,
    /// Housekeeping.
    Maintenance,
}

string_enum!(JobCategory, "job category", {
    Ingestion => "ingestion",
    Sync => "sync",
    Recurrence => "recurrence",
    Orchestration => "orchestration",
    Documents => "documents",
    Notifications => "notifications",
    Export => "export",
    Maintenance => "maintenance",
});

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Leased by a worker
    Processing,
    /// Completed successfully
    Completed,
    /// Failed, will be retried at `next_retry_at`
    Failed,
    /// Archived in the dead-letter queue
    DeadLettered,
    /// Cancelled by the producer before it ran
    Cancelled,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    DeadLettered => "dead_lettered",
    Cancelled => "cancelled",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }

    /// Whether the producer may still cancel a job in this status.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

/// Classification of a handler failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Infrastructure hiccup (timeouts, connection resets).
    Transient,
    /// Handler-level failure that may succeed on another attempt.
    Retryable,
    /// Will never succeed; dead-lettered immediately.
    NonRetryable,
    /// Upstream asked us to slow down.
    RateLimited,
}

string_enum!(ErrorClass, "error class", {
    Transient => "transient",
    Retryable => "retryable",
    NonRetryable => "non_retryable",
    RateLimited => "rate_limited",
});

impl ErrorClass {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ErrorClass::NonRetryable)
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub category: JobCategory,
    /// Handler name used for routing.
    pub job_type: String,
    pub payload: serde_json::Value,
    pub payload_version: u32,
    /// Unique per tenant among non-cancelled jobs.
    pub idempotency_key: String,
    pub correlation_id: CorrelationId,
    pub status: JobStatus,
    /// 0 is most urgent.
    pub priority: u8,
    /// Earliest time the job is eligible to run.
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_worker: Option<WorkerId>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_class: Option<ErrorClass>,
    /// Redacted message of the most recent failure.
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Dead-letter entry this job was created from, if it is a reprocessing run.
    pub reprocessed_from: Option<DeadLetterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Lease token of the current owner, if the job is being processed.
    pub fn lease(&self) -> Option<Lease> {
        if self.status != JobStatus::Processing {
            return None;
        }
        match (&self.claimed_by_worker, self.claimed_at) {
            (Some(worker_id), Some(claimed_at)) => Some(Lease {
                job_id: self.job_id,
                tenant_id: self.tenant_id,
                worker_id: worker_id.clone(),
                claimed_at,
            }),
            _ => None,
        }
    }

    /// Whether `lease` still matches the stored ownership.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.job_id == lease.job_id
            && self.tenant_id == lease.tenant_id
            && self.status == JobStatus::Processing
            && self.claimed_by_worker.as_ref() == Some(&lease.worker_id)
            && self.claimed_at == Some(lease.claimed_at)
    }

    /// Whether the job may be claimed at `now`, given the lease cutoff
    /// (`now - lease_timeout`) for reclaiming abandoned work.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_cutoff: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.scheduled_at <= now,
            JobStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            JobStatus::Processing => self.claimed_at.is_some_and(|at| at <= lease_cutoff),
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl TenantScoped for Job {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Ownership token handed to a worker by a claim.
///
/// Completion and failure writes only apply while the stored job still carries
/// exactly this `(job_id, worker_id, claimed_at)` with status `Processing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

/// Failure details recorded on a job (message already redacted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub error_class: ErrorClass,
    pub message: String,
}

/// Producer request to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub category: JobCategory,
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub payload_version: u32,
    pub correlation_id: CorrelationId,
    pub priority: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    /// Create an enqueue request.
    ///
    /// `idempotency_key` should be derived deterministically from the work item,
    /// e.g. `"email-fetch:{connection_id}:{external_message_id}"`.
    pub fn new(
        tenant_id: TenantId,
        category: JobCategory,
        job_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            category,
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            payload_version: 1,
            correlation_id: CorrelationId::new(),
            priority: DEFAULT_PRIORITY,
            scheduled_at: None,
            max_attempts: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_payload_version(mut self, version: u32) -> Self {
        self.payload_version = version;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Delay eligibility until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Validate producer input.
    pub fn validate(&self) -> DomainResult<()> {
        if self.tenant_id.is_nil() {
            return Err(DomainError::validation("tenant_id must not be nil"));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency_key must not be empty"));
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.job_type.len() > MAX_JOB_TYPE_LEN {
            return Err(DomainError::validation(format!(
                "job_type exceeds {MAX_JOB_TYPE_LEN} bytes"
            )));
        }
        if self.payload_version == 0 {
            return Err(DomainError::validation("payload_version must be >= 1"));
        }
        if self.priority > MAX_PRIORITY {
            return Err(DomainError::validation(format!(
                "priority must be in 0..={MAX_PRIORITY}"
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(DomainError::validation("max_attempts must be >= 1"));
        }
        Ok(())
    }

    /// Materialize the pending job row.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> Job {
        Job {
            job_id: JobId::new(),
            tenant_id: self.tenant_id,
            category: self.category,
            job_type: self.job_type,
            payload: self.payload,
            payload_version: self.payload_version,
            idempotency_key: self.idempotency_key,
            correlation_id: self.correlation_id,
            status: JobStatus::Pending,
            priority: self.priority,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            claimed_at: None,
            claimed_by_worker: None,
            attempt_count: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            next_retry_at: None,
            error_class: None,
            last_error: None,
            result: None,
            reprocessed_from: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn new_job() -> NewJob {
        NewJob::new(
            test_tenant(),
            JobCategory::Ingestion,
            "email.fetch",
            "email-fetch:conn-1:msg-1",
            serde_json::json!({"message_id": "msg-1"}),
        )
    }

    #[test]
    fn defaults_applied_on_materialization() {
        let now = Utc::now();
        let job = new_job().into_job(5, now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.payload_version, 1);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.scheduled_at, now);
        assert_eq!(job.attempt_count, 0);
        assert!(job.lease().is_none());
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(new_job().validate().is_ok());

        let blank_key = NewJob {
            idempotency_key: "   ".into(),
            ..new_job()
        };
        assert!(blank_key.validate().is_err());

        let long_key = NewJob {
            idempotency_key: "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1),
            ..new_job()
        };
        assert!(long_key.validate().is_err());

        assert!(new_job().with_priority(10).validate().is_err());
        assert!(new_job().with_payload_version(0).validate().is_err());
        assert!(new_job().with_max_attempts(0).validate().is_err());

        let nil_tenant = NewJob {
            tenant_id: TenantId::from_uuid(Uuid::nil()),
            ..new_job()
        };
        assert!(nil_tenant.validate().is_err());

        let empty_type = NewJob {
            job_type: String::new(),
            ..new_job()
        };
        assert!(empty_type.validate().is_err());
    }

    #[test]
    fn key_at_limit_is_accepted() {
        let job = NewJob {
            idempotency_key: "k".repeat(MAX_IDEMPOTENCY_KEY_LEN),
            ..new_job()
        };
        assert!(job.validate().is_ok());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
        for category in JobCategory::ALL {
            assert_eq!(category.as_str().parse::<JobCategory>().unwrap(), *category);
        }
        assert_eq!("rate_limited".parse::<ErrorClass>().unwrap(), ErrorClass::RateLimited);
        assert!("exploded".parse::<ErrorClass>().is_err());
    }

    #[test]
    fn claimability_by_status() {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(300);
        let mut job = new_job().into_job(5, now);
        assert!(job.is_claimable(now, cutoff));

        job.scheduled_at = now + chrono::Duration::seconds(1);
        assert!(!job.is_claimable(now, cutoff));

        job.status = JobStatus::Failed;
        job.next_retry_at = Some(now);
        assert!(job.is_claimable(now, cutoff));

        job.status = JobStatus::Processing;
        job.claimed_at = Some(now - chrono::Duration::seconds(10));
        assert!(!job.is_claimable(now, cutoff));
        job.claimed_at = Some(cutoff);
        assert!(job.is_claimable(now, cutoff));

        job.status = JobStatus::Completed;
        assert!(!job.is_claimable(now, cutoff));
    }

    #[test]
    fn lease_matches_only_current_owner() {
        let now = Utc::now();
        let mut job = new_job().into_job(5, now);
        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        job.claimed_by_worker = Some(WorkerId::new("w1"));

        let lease = job.lease().unwrap();
        assert!(job.is_held_by(&lease));

        job.claimed_by_worker = Some(WorkerId::new("w2"));
        assert!(!job.is_held_by(&lease));
    }
}
