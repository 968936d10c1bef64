//! In-memory job store for tests, development and single-process embedding.
//!
//! Every operation runs under one mutex, which makes the claim and all
//! lease-checked writes trivially atomic. The lock is never held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use quotecash_core::TenantId;

use super::{
    ClaimRequest, Completion, JobFilter, JobStats, JobStore, JobStoreError, Review,
    ReviewTransition,
};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetterReason, ReprocessStatus};
use crate::types::{DeadLetterId, Job, JobFailure, JobId, JobStatus, Lease};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// `(tenant, idempotency_key)` of every non-cancelled job.
    keys: HashMap<(TenantId, String), JobId>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

impl State {
    fn insert_job(&mut self, job: Job) -> Result<Job, JobStoreError> {
        let key = (job.tenant_id, job.idempotency_key.clone());
        if self.keys.contains_key(&key) {
            return Err(JobStoreError::DuplicateKeyRace(job.idempotency_key));
        }
        self.keys.insert(key, job.job_id);
        self.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    /// The job behind `lease`, if the lease is still current.
    fn leased_job(&mut self, lease: &Lease) -> Result<&mut Job, JobStoreError> {
        match self.jobs.get_mut(&lease.job_id) {
            Some(job) if job.is_held_by(lease) => Ok(job),
            _ => Err(JobStoreError::LeaseLost(lease.job_id)),
        }
    }
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

fn release_lease(job: &mut Job, now: DateTime<Utc>) {
    job.claimed_at = None;
    job.claimed_by_worker = None;
    job.updated_at = now;
}

fn record_failure(job: &mut Job, failure: &JobFailure) {
    job.error_class = Some(failure.error_class);
    job.last_error = Some(failure.message.clone());
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let state = self.state()?;
        Ok(state
            .keys
            .get(&(tenant_id, idempotency_key.to_string()))
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        self.state()?.insert_job(job)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let state = self.state()?;
        Ok(state
            .jobs
            .get(&job_id)
            .filter(|job| job.tenant_id == tenant_id)
            .cloned())
    }

    async fn claim(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut state = self.state()?;

        let mut candidates: Vec<_> = state
            .jobs
            .values()
            .filter(|job| request.matches(job) && job.is_claimable(now, lease_cutoff))
            .map(|job| (job.priority, job.scheduled_at, job.job_id))
            .collect();
        candidates.sort();
        candidates.truncate(request.batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, job_id) in candidates {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Processing {
                job.attempt_count += 1;
            }
            job.status = JobStatus::Processing;
            job.claimed_at = Some(now);
            job.claimed_by_worker = Some(request.worker_id.clone());
            job.started_at = Some(now);
            job.next_retry_at = None;
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn renew_lease(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut state = self.state()?;
        let job = state.leased_job(lease)?;
        job.claimed_at = Some(now);
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn complete(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Completion, JobStoreError> {
        let mut state = self.state()?;
        let job = state.leased_job(lease)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.result = result;
        release_lease(job, now);
        let job = job.clone();

        let resolved_entry = match job.reprocessed_from {
            Some(entry_id) => state
                .dead_letters
                .get_mut(&entry_id)
                .filter(|entry| entry.tenant_id == job.tenant_id)
                .and_then(|entry| entry.resolve_by_job(job.job_id, now).then(|| entry.clone())),
            None => None,
        };

        Ok(Completion {
            job,
            resolved_entry,
        })
    }

    async fn fail(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut state = self.state()?;
        let job = state.leased_job(lease)?;
        job.status = JobStatus::Failed;
        job.next_retry_at = Some(next_retry_at);
        record_failure(job, failure);
        release_lease(job, now);
        Ok(job.clone())
    }

    async fn dead_letter(
        &self,
        lease: &Lease,
        failure: &JobFailure,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
    ) -> Result<(Job, DeadLetterEntry), JobStoreError> {
        let mut state = self.state()?;
        let job = state.leased_job(lease)?;
        job.status = JobStatus::DeadLettered;
        job.next_retry_at = None;
        job.completed_at = Some(now);
        record_failure(job, failure);
        release_lease(job, now);
        let job = job.clone();

        let existing = match job.reprocessed_from {
            Some(entry_id) => state
                .dead_letters
                .get_mut(&entry_id)
                .filter(|entry| entry.tenant_id == job.tenant_id),
            None => None,
        };
        let entry = match existing {
            Some(entry) => {
                entry.refresh(&job, failure, reason, now);
                entry.clone()
            }
            None => {
                let entry = DeadLetterEntry::from_job(DeadLetterId::new(), &job, failure, reason, now);
                state.dead_letters.insert(entry.entry_id, entry.clone());
                entry
            }
        };
        Ok((job, entry))
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut state = self.state()?;
        let job = match state.jobs.get_mut(&job_id) {
            Some(job) if job.tenant_id == tenant_id => job,
            _ => return Err(JobStoreError::NotFound(job_id)),
        };
        if !job.status.is_cancellable() {
            return Err(JobStoreError::InvalidTransition(format!(
                "cannot cancel job {job_id} in status {}",
                job.status
            )));
        }
        job.status = JobStatus::Cancelled;
        job.next_retry_at = None;
        job.updated_at = now;
        let job = job.clone();
        state.keys.remove(&(job.tenant_id, job.idempotency_key.clone()));
        Ok(job)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.job_id));
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let state = self.state()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values().filter(|job| job.tenant_id == tenant_id) {
            stats.count(job.status, 1);
        }
        stats.dead_letters_pending_review = state
            .dead_letters
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.reprocess_status == ReprocessStatus::PendingReview)
            .count();
        Ok(stats)
    }

    async fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let state = self.state()?;
        Ok(state
            .dead_letters
            .get(&entry_id)
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let state = self.state()?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.dead_lettered_at, entry.entry_id));
        entries.truncate(filter.limit);
        Ok(entries)
    }

    async fn reprocess_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        review: &Review,
    ) -> Result<(DeadLetterEntry, Job), JobStoreError> {
        let mut state = self.state()?;
        let entry = match state.dead_letters.get(&entry_id) {
            Some(entry) if entry.tenant_id == tenant_id => entry,
            _ => return Err(JobStoreError::DeadLetterNotFound(entry_id)),
        };
        if entry.reprocess_status != ReprocessStatus::PendingReview {
            return Err(JobStoreError::InvalidTransition(format!(
                "cannot reprocess dead letter {entry_id} in status {}",
                entry.reprocess_status
            )));
        }

        let entry = entry.clone();

        // A producer may already own a derived key; move on to the next generation.
        let mut inserted = None;
        for generation in entry.next_generations() {
            match state.insert_job(entry.reprocess_job(generation, review.at)) {
                Ok(job) => {
                    inserted = Some((generation, job));
                    break;
                }
                Err(JobStoreError::DuplicateKeyRace(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let Some((generation, job)) = inserted else {
            return Err(JobStoreError::InvalidTransition(format!(
                "no free reprocess key for dead letter {entry_id}"
            )));
        };

        let entry = state
            .dead_letters
            .get_mut(&entry_id)
            .ok_or(JobStoreError::DeadLetterNotFound(entry_id))?;
        entry.mark_reprocessing(&job, generation, review);
        Ok((entry.clone(), job))
    }

    async fn review_dead_letter(
        &self,
        tenant_id: TenantId,
        entry_id: DeadLetterId,
        transition: ReviewTransition,
        review: &Review,
    ) -> Result<DeadLetterEntry, JobStoreError> {
        let mut state = self.state()?;
        let entry = match state.dead_letters.get_mut(&entry_id) {
            Some(entry) if entry.tenant_id == tenant_id => entry,
            _ => return Err(JobStoreError::DeadLetterNotFound(entry_id)),
        };
        if !transition.allowed_from().contains(&entry.reprocess_status) {
            return Err(JobStoreError::InvalidTransition(format!(
                "cannot move dead letter {entry_id} from {} to {}",
                entry.reprocess_status,
                transition.target()
            )));
        }
        entry.reprocess_status = transition.target();
        entry.record_review(review);
        Ok(entry.clone())
    }
}
