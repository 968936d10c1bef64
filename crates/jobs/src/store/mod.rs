//! Job storage implementations.
//!
//! The store is the only shared mutable resource of the queue. Every mutation
//! is either the atomic claim or a single-row, lease-checked update, so any
//! number of workers (in one process or many) can share one store safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use quotecash_core::{TenantId, UserId};

use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterReason, ReprocessStatus};
use crate::types::{DeadLetterId, Job, JobCategory, JobFailure, JobId, JobStatus, Lease, WorkerId};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store abstraction.
///
/// All timestamps are supplied by the caller so the queue's clock is the single
/// source of time.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Find the non-cancelled job holding `(tenant_id, idempotency_key)`.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Insert a new pending job.
    ///
    /// Fails with [`JobStoreError::DuplicateKeyRace`] when another non-cancelled
    /// job already holds the idempotency key.
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID. Jobs of other tenants are reported as absent.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically lease up to `request.batch_size` eligible jobs.
    ///
    /// Eligible: pending and due, failed and due for retry, or processing with
    /// `claimed_at <= lease_cutoff` (abandoned lease). Reclaiming an abandoned
    /// lease does not count as a new attempt.
    async fn claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Restart the lease clock of a job the caller still holds.
    ///
    /// Sets `claimed_at` and `started_at` to `now`; the returned job carries the
    /// new lease. Fails with `LeaseLost` once another worker has reclaimed it.
    async fn renew_lease(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Mark a leased job completed.
    ///
    /// If the job is a reprocessing run, its dead-letter entry moves from
    /// `reprocessing` to `resolved` in the same transaction.
    async fn complete(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError>;

    /// Record a failed attempt and re-arm the job for `next_retry_at`.
    async fn fail(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Mark a leased job dead-lettered and archive it.
    ///
    /// A job created by reprocessing returns its existing entry to
    /// `pending_review` instead of creating a second one.
    async fn dead_letter(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<(Job, DeadLetterEntry), JobStoreError>;

    /// Cancel a pending or failed job, releasing its idempotency key.
    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// List jobs of a tenant, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    /// List dead-letter entries, oldest first.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Create a new pending job from an entry under review and mark the entry
    /// `reprocessing`, atomically.
    async fn reprocess_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        review: &Review,
    ) -> Result<(DeadLetterEntry, Job), JobStoreError>;

    /// Discard or resolve an entry, checking it is in an allowed status.
    async fn review_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        transition: ReviewTransition,
        review: &Review,
    ) -> Result<DeadLetterEntry, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),
    #[error("idempotency key already taken: {0}")]
    DuplicateKeyRace(String),
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// A worker's request for work.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: WorkerId,
    /// Only claim jobs of this tenant.
    pub tenant_id: Option<TenantId>,
    /// Only claim jobs of these categories (all when empty).
    pub categories: Vec<JobCategory>,
    pub batch_size: usize,
}

impl ClaimRequest {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            tenant_id: None,
            categories: Vec::new(),
            batch_size: 1,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = JobCategory>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|t| t == job.tenant_id)
            && (self.categories.is_empty() || self.categories.contains(&job.category))
    }
}

/// Outcome of a completion write.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: Job,
    /// Dead-letter entry resolved because this reprocessing run succeeded.
    pub resolved_entry: Option<DeadLetterEntry>,
}

/// Producer-side job listing filter.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub tenant_id: TenantId,
    pub status: Option<JobStatus>,
    pub category: Option<JobCategory>,
    pub limit: usize,
}

impl JobFilter {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            status: None,
            category: None,
            limit: 100,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_category(mut self, category: JobCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        job.tenant_id == self.tenant_id
            && self.status.is_none_or(|s| s == job.status)
            && self.category.is_none_or(|c| c == job.category)
    }
}

/// Operator action on a dead-letter entry.
#[derive(Debug, Clone)]
pub struct Review {
    pub operator: UserId,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Allowed status change for a review action that creates no job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewTransition {
    /// `pending_review -> discarded`
    Discard,
    /// `pending_review | reprocessing -> resolved`
    Resolve,
}

impl ReviewTransition {
    pub fn allowed_from(&self) -> &'static [ReprocessStatus] {
        match self {
            ReviewTransition::Discard => &[ReprocessStatus::PendingReview],
            ReviewTransition::Resolve => &[ReprocessStatus::PendingReview, ReprocessStatus::Reprocessing],
        }
    }

    pub fn target(&self) -> ReprocessStatus {
        match self {
            ReviewTransition::Discard => ReprocessStatus::Discarded,
            ReviewTransition::Resolve => ReprocessStatus::Resolved,
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
    /// Dead-letter entries waiting for an operator.
    pub dead_letters_pending_review: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::DeadLettered => self.dead_lettered += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}
