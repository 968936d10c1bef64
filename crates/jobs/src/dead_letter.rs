//! Dead-letter queue: archival of permanently failed jobs and supervised
//! reprocessing.
//!
//! ## Lifecycle
//!
//! ```text
//! pending_review --reprocess--> reprocessing --job completes--> resolved
//!       |  ^                         |
//!       |  +---job dead-letters------+
//!       +--discard--> discarded
//!       +--resolve--> resolved   (also allowed from reprocessing)
//! ```
//!
//! Entries are never deleted. A reprocessing job that fails permanently sends
//! its entry back to `pending_review` with refreshed failure details rather than
//! creating a second entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quotecash_core::{CorrelationId, TenantId, TenantScoped, UserId};

use crate::error::JobError;
use crate::events::{JobEvent, JobEventKind};
use crate::queue::JobQueue;
use crate::store::{JobStore, Review, ReviewTransition};
use crate::types::{
    DeadLetterId, ErrorClass, Job, JobCategory, JobFailure, JobId, JobStatus,
    MAX_IDEMPOTENCY_KEY_LEN,
};

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The handler reported a failure that can never succeed.
    NonRetryable,
    /// A retriable failure happened on the last allowed attempt.
    ExhaustedRetries,
}

string_enum!(DeadLetterReason, "dead-letter reason", {
    NonRetryable => "non_retryable",
    ExhaustedRetries => "exhausted_retries",
});

/// Review state of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessStatus {
    PendingReview,
    Reprocessing,
    Resolved,
    Discarded,
}

string_enum!(ReprocessStatus, "reprocess status", {
    PendingReview => "pending_review",
    Reprocessing => "reprocessing",
    Resolved => "resolved",
    Discarded => "discarded",
});

/// Derived keys tried per reprocess request before giving up on collisions
/// with live jobs.
pub const REPROCESS_KEY_ATTEMPTS: u32 = 8;

/// Idempotency key of the `generation`-th reprocessing job of an entry.
///
/// The original key is shortened at a character boundary when needed so the
/// result stays within [`MAX_IDEMPOTENCY_KEY_LEN`].
pub fn derive_reprocess_key(original_key: &str, generation: u32) -> String {
    let suffix = format!(":reprocess:{generation}");
    let mut end = original_key
        .len()
        .min(MAX_IDEMPOTENCY_KEY_LEN.saturating_sub(suffix.len()));
    while !original_key.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{suffix}", &original_key[..end])
}

/// Archival record of a job that exhausted retries or hit a non-retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: DeadLetterId,
    /// Weak back-reference to the job that was first archived here.
    pub original_job_id: JobId,
    pub tenant_id: TenantId,
    pub category: JobCategory,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub payload_version: u32,
    pub idempotency_key: String,
    pub correlation_id: CorrelationId,
    pub priority: u8,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_class: ErrorClass,
    pub last_error: String,
    pub reason: DeadLetterReason,
    pub reprocess_status: ReprocessStatus,
    /// Most recent job created by reprocessing.
    pub new_job_id: Option<JobId>,
    pub reprocess_generation: u32,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_note: Option<String>,
    pub job_created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Archive `job` (already carrying the failed attempt in `attempt_count`).
    pub fn from_job(
        entry_id: DeadLetterId,
        job: &Job,
        failure: &JobFailure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id,
            original_job_id: job.job_id,
            tenant_id: job.tenant_id,
            category: job.category,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            payload_version: job.payload_version,
            idempotency_key: job.idempotency_key.clone(),
            correlation_id: job.correlation_id,
            priority: job.priority,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            error_class: failure.error_class,
            last_error: failure.message.clone(),
            reason,
            reprocess_status: ReprocessStatus::PendingReview,
            new_job_id: None,
            reprocess_generation: 0,
            reviewed_by: None,
            reviewed_at: None,
            review_note: None,
            job_created_at: job.created_at,
            dead_lettered_at: now,
            updated_at: now,
        }
    }

    /// Put the entry back under review after its reprocessing job failed
    /// permanently.
    pub fn refresh(
        &mut self,
        job: &Job,
        failure: &JobFailure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) {
        self.attempt_count = job.attempt_count;
        self.error_class = failure.error_class;
        self.last_error = failure.message.clone();
        self.reason = reason;
        self.reprocess_status = ReprocessStatus::PendingReview;
        self.dead_lettered_at = now;
        self.updated_at = now;
    }

    /// Build the pending job for the next reprocessing generation.
    ///
    /// Carries the original payload, version, priority and attempt budget under
    /// a derived idempotency key.
    /// Generations to try for the next reprocessing job, in order.
    pub fn next_generations(&self) -> std::ops::Range<u32> {
        let next = self.reprocess_generation.saturating_add(1);
        next..next.saturating_add(REPROCESS_KEY_ATTEMPTS)
    }

    pub fn reprocess_job(&self, generation: u32, now: DateTime<Utc>) -> Job {
        Job {
            job_id: JobId::new(),
            tenant_id: self.tenant_id,
            category: self.category,
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            payload_version: self.payload_version,
            idempotency_key: derive_reprocess_key(&self.idempotency_key, generation),
            correlation_id: self.correlation_id,
            status: JobStatus::Pending,
            priority: self.priority,
            scheduled_at: now,
            claimed_at: None,
            claimed_by_worker: None,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            next_retry_at: None,
            error_class: None,
            last_error: None,
            result: None,
            reprocessed_from: Some(self.entry_id),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Record that `job` was created from this entry.
    pub fn mark_reprocessing(&mut self, job: &Job, generation: u32, review: &Review) {
        self.reprocess_status = ReprocessStatus::Reprocessing;
        self.new_job_id = Some(job.job_id);
        self.reprocess_generation = generation;
        self.record_review(review);
    }

    pub fn record_review(&mut self, review: &Review) {
        self.reviewed_by = Some(review.operator);
        self.reviewed_at = Some(review.at);
        self.review_note = review.note.clone();
        self.updated_at = review.at;
    }

    /// Automated resolution when the reprocessing job `job_id` succeeds.
    ///
    /// Returns false (and changes nothing) unless the entry is still waiting on
    /// exactly that job.
    pub fn resolve_by_job(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        if self.reprocess_status != ReprocessStatus::Reprocessing || self.new_job_id != Some(job_id) {
            return false;
        }
        self.reprocess_status = ReprocessStatus::Resolved;
        self.updated_at = now;
        true
    }
}

impl TenantScoped for DeadLetterEntry {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Operator listing filter.
#[derive(Debug, Clone)]
pub struct DeadLetterFilter {
    pub tenant_id: TenantId,
    pub category: Option<JobCategory>,
    pub error_class: Option<ErrorClass>,
    pub reprocess_status: Option<ReprocessStatus>,
    pub limit: usize,
}

impl DeadLetterFilter {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            category: None,
            error_class: None,
            reprocess_status: None,
            limit: 100,
        }
    }

    pub fn with_category(mut self, category: JobCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_error_class(mut self, error_class: ErrorClass) -> Self {
        self.error_class = Some(error_class);
        self
    }

    pub fn with_status(mut self, status: ReprocessStatus) -> Self {
        self.reprocess_status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn matches(&self, entry: &DeadLetterEntry) -> bool {
        entry.tenant_id == self.tenant_id
            && self.category.is_none_or(|c| c == entry.category)
            && self.error_class.is_none_or(|e| e == entry.error_class)
            && self.reprocess_status.is_none_or(|s| s == entry.reprocess_status)
    }
}

/// Operator surface of the dead-letter queue.
///
/// Obtained from [`JobQueue::dead_letters`]; shares the queue's store, clock
/// and event sink.
pub struct DeadLetterManager<S: JobStore> {
    queue: JobQueue<S>,
}

impl<S: JobStore> Clone for DeadLetterManager<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<S: JobStore> DeadLetterManager<S> {
    pub(crate) fn new(queue: JobQueue<S>) -> Self {
        Self { queue }
    }

    /// Dead-letter a job currently leased by the caller.
    pub async fn move_to_dlq(
        &self,
        job: &Job,
        failure: JobFailure,
        reason: DeadLetterReason,
    ) -> Result<DeadLetterEntry, JobError> {
        let (_, entry) = self.archive(job, &failure, reason, None).await?;
        Ok(entry)
    }

    pub(crate) async fn archive(
        &self,
        job: &Job,
        failure: &JobFailure,
        reason: DeadLetterReason,
        duration: Option<Duration>,
    ) -> Result<(Job, DeadLetterEntry), JobError> {
        let lease = job.lease().ok_or_else(|| {
            JobError::InvalidTransition(format!("job {} is not leased", job.job_id))
        })?;
        let now = self.queue.clock().now();
        let (job, entry) = self
            .queue
            .store()
            .dead_letter(&lease, failure, reason, now)
            .await?;

        warn!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            correlation_id = %job.correlation_id,
            entry_id = %entry.entry_id,
            job_type = %job.job_type,
            reason = %reason,
            error_class = %failure.error_class,
            attempt_count = job.attempt_count,
            "job dead-lettered"
        );

        let mut event = JobEvent::for_job(JobEventKind::JobDeadLettered, &job, now)
            .with_entry(entry.entry_id);
        if let Some(duration) = duration {
            event = event.with_duration(duration);
        }
        self.queue.events().emit(&event);

        Ok((job, entry))
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobError> {
        Ok(self.queue.store().get_dead_letter(tenant_id, entry_id).await?)
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, JobError> {
        Ok(self.queue.store().list_dead_letters(filter).await?)
    }

    /// Create a fresh pending job from an entry under review.
    pub async fn reprocess(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        operator: UserId,
    ) -> Result<Job, JobError> {
        let review = self.review(operator, None);
        let (entry, job) = self
            .queue
            .store()
            .reprocess_dead_letter(tenant_id, entry_id, &review)
            .await?;

        info!(
            entry_id = %entry.entry_id,
            tenant_id = %entry.tenant_id,
            correlation_id = %entry.correlation_id,
            job_id = %job.job_id,
            generation = entry.reprocess_generation,
            operator = %operator,
            "dead letter reprocessed"
        );
        self.emit(JobEventKind::DeadLetterReprocessed, &entry, &review, Some(job.job_id));

        Ok(job)
    }

    /// Close an entry without running it again.
    pub async fn discard(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        operator: UserId,
        note: Option<String>,
    ) -> Result<DeadLetterEntry, JobError> {
        self.apply(tenant_id, entry_id, ReviewTransition::Discard, operator, note)
            .await
    }

    /// Mark an entry handled (e.g. fixed out of band).
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        operator: UserId,
        note: Option<String>,
    ) -> Result<DeadLetterEntry, JobError> {
        self.apply(tenant_id, entry_id, ReviewTransition::Resolve, operator, note)
            .await
    }

    async fn apply(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        transition: ReviewTransition,
        operator: UserId,
        note: Option<String>,
    ) -> Result<DeadLetterEntry, JobError> {
        let review = self.review(operator, note);
        let entry = self
            .queue
            .store()
            .review_dead_letter(tenant_id, entry_id, transition, &review)
            .await?;

        let kind = match transition {
            ReviewTransition::Discard => JobEventKind::DeadLetterDiscarded,
            ReviewTransition::Resolve => JobEventKind::DeadLetterResolved,
        };
        info!(
            entry_id = %entry.entry_id,
            tenant_id = %entry.tenant_id,
            status = %entry.reprocess_status,
            operator = %operator,
            "dead letter reviewed"
        );
        self.emit(kind, &entry, &review, None);

        Ok(entry)
    }

    fn review(&self, operator: UserId, note: Option<String>) -> Review {
        Review {
            operator,
            note,
            at: self.queue.clock().now(),
        }
    }

    fn emit(&self, kind: JobEventKind, entry: &DeadLetterEntry, review: &Review, job_id: Option<JobId>) {
        let mut event = JobEvent::for_entry(kind, entry, review.at).with_operator(review.operator);
        event.job_id = job_id;
        self.queue.events().emit(&event);
    }
}
