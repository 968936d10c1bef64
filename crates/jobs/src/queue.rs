//! Producer and worker entry points: enqueue, claim, query, cancel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use quotecash_core::TenantId;

use crate::clock::{Clock, SystemClock, elapsed_between, to_delta};
use crate::config::QueueConfig;
use crate::dead_letter::DeadLetterManager;
use crate::error::JobError;
use crate::events::{JobEvent, JobEventKind, JobEventSink, TracingEventSink};
use crate::store::{ClaimRequest, JobFilter, JobStats, JobStore, JobStoreError};
use crate::types::{Job, JobId, NewJob};

/// Read-then-insert rounds before an idempotency race is reported as a store failure.
const ENQUEUE_RACE_ATTEMPTS: usize = 3;

/// Result of an enqueue.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub job: Job,
    /// True when an existing job with the same idempotency key was returned.
    pub duplicate: bool,
}

/// Tenant-scoped job queue backed by a [`JobStore`].
///
/// Cheap to clone; clones share the store, clock and event sink.
pub struct JobQueue<S: JobStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn JobEventSink>,
    config: QueueConfig,
}

impl<S: JobStore> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    /// Create a queue with the wall clock and tracing event sink.
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn JobEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<dyn JobEventSink> {
        &self.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Operator access to the dead-letter queue.
    pub fn dead_letters(&self) -> DeadLetterManager<S> {
        DeadLetterManager::new(self.clone())
    }

    /// Enqueue a job, or return the existing one holding the same
    /// `(tenant_id, idempotency_key)`.
    #[instrument(
        skip(self, new_job),
        fields(
            tenant_id = %new_job.tenant_id,
            job_type = %new_job.job_type,
            correlation_id = %new_job.correlation_id
        ),
        err
    )]
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Enqueued, JobError> {
        new_job.validate()?;

        for attempt in 1..=ENQUEUE_RACE_ATTEMPTS {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(new_job.tenant_id, &new_job.idempotency_key)
                .await?
            {
                debug!(job_id = %existing.job_id, "idempotency key already enqueued");
                self.emit_enqueued(&existing, true);
                return Ok(Enqueued {
                    job: existing,
                    duplicate: true,
                });
            }

            let now = self.clock.now();
            let job = new_job
                .clone()
                .into_job(self.config.default_max_attempts, now);
            match self.store.insert(job).await {
                Ok(job) => {
                    info!(
                        job_id = %job.job_id,
                        category = %job.category,
                        priority = job.priority,
                        scheduled_at = %job.scheduled_at,
                        "job enqueued"
                    );
                    self.emit_enqueued(&job, false);
                    return Ok(Enqueued {
                        job,
                        duplicate: false,
                    });
                }
                Err(JobStoreError::DuplicateKeyRace(_)) => {
                    debug!(attempt, "lost idempotency key race, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(JobError::Store(JobStoreError::Storage(format!(
            "idempotency key race unresolved after {ENQUEUE_RACE_ATTEMPTS} attempts"
        ))))
    }

    fn emit_enqueued(&self, job: &Job, duplicate: bool) {
        let now = self.clock.now();
        self.events.emit(
            &JobEvent::for_job(JobEventKind::JobEnqueued, job, now)
                .with_duration(elapsed_between(job.created_at, now))
                .with_duplicate(duplicate),
        );
    }

    /// Lease up to `request.batch_size` ready jobs. Never blocks waiting for work.
    #[instrument(
        skip(self, request),
        fields(worker_id = %request.worker_id, batch_size = request.batch_size),
        err
    )]
    pub async fn claim(&self, request: &ClaimRequest) -> Result<Vec<Job>, JobError> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let jobs = self
            .store
            .claim(request, now, self.lease_cutoff(now))
            .await?;

        for job in &jobs {
            debug!(
                job_id = %job.job_id,
                tenant_id = %job.tenant_id,
                job_type = %job.job_type,
                attempt_count = job.attempt_count,
                "claimed job"
            );
            self.events.emit(
                &JobEvent::for_job(JobEventKind::JobClaimed, job, now)
                    .with_duration(elapsed_between(job.scheduled_at, now))
                    .with_worker(request.worker_id.clone()),
            );
        }
        Ok(jobs)
    }

    fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(to_delta(self.config.lease_timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Tenant-scoped lookup; another tenant's job is reported as absent.
    pub async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.store.get(tenant_id, job_id).await?)
    }

    /// Cancel a job that is pending or waiting for a retry.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobError> {
        let job = self.store.cancel(tenant_id, job_id, self.clock.now()).await?;
        info!(job_id = %job.job_id, "job cancelled");
        Ok(job)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobError> {
        Ok(self.store.stats(tenant_id).await?)
    }
}
