//! Job execution: the harness around a single handler invocation and the
//! worker pool that drains the queue.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterReason;
use crate::error::JobError;
use crate::events::{JobEvent, JobEventKind};
use crate::handler::{HandlerContext, HandlerRegistry, JobHandler, Outcome};
use crate::queue::JobQueue;
use crate::redact::redact_error;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::{ClaimRequest, JobStore, JobStoreError};
use crate::types::{DeadLetterId, ErrorClass, Job, JobFailure, JobId, WorkerId};

/// How an execution ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Completed,
    /// Failed; will be retried at `next_retry_at`.
    Retrying {
        error_class: ErrorClass,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        entry_id: DeadLetterId,
        reason: DeadLetterReason,
    },
    /// The lease was reclaimed by another worker, either before the handler
    /// started (it was not run) or before the result was recorded (the result
    /// was dropped).
    LeaseLost,
}

/// Report of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub result: ExecutionResult,
    pub duration: Duration,
}

/// Runs claimed jobs through their handlers and records the outcome.
pub struct ExecutionHarness<S: JobStore> {
    queue: JobQueue<S>,
    registry: Arc<HandlerRegistry>,
    scheduler: RetryScheduler,
    handler_timeout: Duration,
}

impl<S: JobStore> Clone for ExecutionHarness<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            handler_timeout: self.handler_timeout,
        }
    }
}

impl<S: JobStore> ExecutionHarness<S> {
    /// Build a harness using the queue's retry policy and handler timeout.
    pub fn new(queue: JobQueue<S>, registry: HandlerRegistry) -> Self {
        let scheduler = RetryScheduler::new(queue.config().retry.clone());
        let handler_timeout = queue.config().handler_timeout;
        Self {
            queue,
            registry: Arc::new(registry),
            scheduler,
            handler_timeout,
        }
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute a claimed job with the handler registered for its `job_type`.
    ///
    /// An unregistered job type is a non-retryable failure. Only store failures
    /// are returned as errors; handler failures are recorded on the job.
    pub async fn execute(&self, job: Job) -> Result<ExecutionReport, JobError> {
        let handler = self.registry.get(&job.job_type);
        self.run(job, handler).await
    }

    /// Execute a claimed job with an explicit handler.
    pub async fn execute_with(
        &self,
        job: Job,
        handler: Arc<dyn JobHandler>,
    ) -> Result<ExecutionReport, JobError> {
        self.run(job, Some(handler)).await
    }

    /// Renew the lease, then run the handler under it.
    ///
    /// A job can sit in a worker's local batch after the claim. Renewal restarts
    /// the lease clock so the handler starts with a full `lease_timeout` ahead of
    /// it; a job reclaimed elsewhere in the meantime is not run.
    async fn run(
        &self,
        job: Job,
        handler: Option<Arc<dyn JobHandler>>,
    ) -> Result<ExecutionReport, JobError> {
        let Some(job) = self.renew(&job).await? else {
            return Ok(self.lease_lost(&job, Duration::ZERO));
        };

        match handler {
            Some(handler) => {
                let ctx = HandlerContext::from_job(&job);
                let started = Instant::now();
                let outcome = self.invoke(handler, ctx).await;
                self.record(job, outcome, started.elapsed()).await
            }
            None => {
                warn!(job_id = %job.job_id, job_type = %job.job_type, "no handler for job type");
                let outcome =
                    Outcome::non_retryable(format!("no handler registered for job type {}", job.job_type));
                self.record(job, outcome, Duration::ZERO).await
            }
        }
    }

    /// The job under a renewed lease, or `None` if the lease is gone.
    async fn renew(&self, job: &Job) -> Result<Option<Job>, JobError> {
        let lease = job.lease().ok_or_else(|| {
            JobError::InvalidTransition(format!("job {} is not leased", job.job_id))
        })?;
        match self.queue.store().renew_lease(&lease, self.queue.clock().now()).await {
            Ok(renewed) => Ok(Some(renewed)),
            Err(JobStoreError::LeaseLost(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_lost(&self, job: &Job, duration: Duration) -> ExecutionReport {
        warn!(
            job_id = %job.job_id,
            worker = job.claimed_by_worker.as_ref().map(|w| w.as_str()).unwrap_or_default(),
            duration_ms = duration.as_millis() as u64,
            "lease lost; job was reclaimed by another worker"
        );
        self.queue.events().emit(
            &JobEvent::for_job(JobEventKind::JobLeaseLost, job, self.queue.clock().now())
                .with_duration(duration),
        );
        ExecutionReport {
            job_id: job.job_id,
            result: ExecutionResult::LeaseLost,
            duration,
        }
    }

    /// Run the handler on its own task so panics and timeouts are contained.
    async fn invoke(&self, handler: Arc<dyn JobHandler>, ctx: HandlerContext) -> Outcome {
        let task = tokio::spawn(async move { handler.handle(&ctx).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                Outcome::retryable(format!("handler panicked: {message}"))
            }
            Ok(Err(_)) => Outcome::transient("handler task was cancelled"),
            Err(_) => {
                abort.abort();
                Outcome::transient(format!(
                    "handler timed out after {}ms",
                    self.handler_timeout.as_millis()
                ))
            }
        }
    }

    async fn record(
        &self,
        job: Job,
        outcome: Outcome,
        duration: Duration,
    ) -> Result<ExecutionReport, JobError> {
        let job_id = job.job_id;
        let snapshot = job.clone();
        let result = match self.apply(job, outcome, duration).await {
            Ok(result) => result,
            Err(JobError::LeaseLost(_)) => return Ok(self.lease_lost(&snapshot, duration)),
            Err(e) => return Err(e),
        };
        Ok(ExecutionReport {
            job_id,
            result,
            duration,
        })
    }

    async fn apply(
        &self,
        job: Job,
        outcome: Outcome,
        duration: Duration,
    ) -> Result<ExecutionResult, JobError> {
        let lease = job.lease().ok_or_else(|| {
            JobError::InvalidTransition(format!("job {} is not leased", job.job_id))
        })?;
        let now = self.queue.clock().now();

        match outcome {
            Outcome::Success(result) => {
                let completion = self.queue.store().complete(&lease, result, now).await?;
                debug!(
                    job_id = %completion.job.job_id,
                    duration_ms = duration.as_millis() as u64,
                    "job completed successfully"
                );
                self.queue.events().emit(
                    &JobEvent::for_job(JobEventKind::JobCompleted, &completion.job, now)
                        .with_duration(duration)
                        .with_worker(lease.worker_id.clone()),
                );
                if let Some(entry) = completion.resolved_entry {
                    info!(
                        entry_id = %entry.entry_id,
                        job_id = %completion.job.job_id,
                        "dead letter resolved by successful reprocessing"
                    );
                    self.queue.events().emit(
                        &JobEvent::for_entry(JobEventKind::DeadLetterResolved, &entry, now)
                            .with_duration(duration),
                    );
                }
                Ok(ExecutionResult::Completed)
            }
            Outcome::Failure {
                class,
                message,
                retry_after,
            } => {
                let failure = JobFailure {
                    error_class: class,
                    message: redact_error(&message),
                };
                match self.scheduler.decide(&job, class, retry_after, now) {
                    RetryDecision::Retry { next_retry_at, delay } => {
                        let failed = self
                            .queue
                            .store()
                            .fail(&lease, &failure, next_retry_at, now)
                            .await?;
                        debug!(
                            job_id = %failed.job_id,
                            error_class = %class,
                            attempt_count = failed.attempt_count,
                            delay_ms = delay.as_millis() as u64,
                            "job failed, retry scheduled"
                        );
                        self.queue.events().emit(
                            &JobEvent::for_job(JobEventKind::JobFailed, &failed, now)
                                .with_duration(duration)
                                .with_worker(lease.worker_id.clone()),
                        );
                        Ok(ExecutionResult::Retrying {
                            error_class: class,
                            next_retry_at,
                        })
                    }
                    RetryDecision::DeadLetter(reason) => {
                        let (_, entry) = self
                            .queue
                            .dead_letters()
                            .archive(&job, &failure, reason, Some(duration))
                            .await?;
                        Ok(ExecutionResult::DeadLettered {
                            entry_id: entry.entry_id,
                            reason,
                        })
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    /// Claimed jobs of a tenant other than the one the pool is pinned to.
    pub jobs_rejected: u64,
    pub store_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl WorkerHandle {
    /// Stop claiming, let in-flight jobs finish and wait for every poll loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Pool of poll loops sharing one harness.
///
/// There is no coordinator: each loop claims, executes, and repeats. Safety
/// rests on the store's atomic claim.
pub struct WorkerPool<S: JobStore> {
    harness: ExecutionHarness<S>,
}

impl<S: JobStore> WorkerPool<S> {
    pub fn new(harness: ExecutionHarness<S>) -> Self {
        Self { harness }
    }

    /// Spawn `config.workers` poll loops on the current tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let joins = (0..config.workers.max(1))
            .map(|index| {
                let worker_id = WorkerId::new(format!("{}-{}", config.name, index));
                let mut request = ClaimRequest::new(worker_id.clone())
                    .with_categories(config.categories.iter().copied())
                    .with_batch_size(config.batch_size.max(1));
                if let Some(tenant_id) = config.tenant_id {
                    request = request.for_tenant(tenant_id);
                }
                tokio::spawn(worker_loop(
                    self.harness.clone(),
                    request,
                    config.clone(),
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(pool = %config.name, workers = config.workers.max(1), "worker pool started");

        WorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

fn with_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

async fn worker_loop<S: JobStore>(
    harness: ExecutionHarness<S>,
    request: ClaimRequest,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    let worker = request.worker_id.clone();
    info!(worker = %worker, "job worker started");
    let mut idle = config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let sleep_for = match harness.queue().claim(&request).await {
            Ok(jobs) if jobs.is_empty() => {
                let current = idle;
                idle = (idle * 2).min(config.max_idle_interval);
                current
            }
            Ok(jobs) => {
                idle = config.poll_interval;
                // Finish the whole batch even if shutdown is requested meanwhile;
                // unexecuted jobs would otherwise sit leased until the lease expires.
                for job in jobs {
                    if !config.accepts(&job) {
                        error!(
                            worker = %worker,
                            job_id = %job.job_id,
                            tenant_id = %job.tenant_id,
                            "claimed job of another tenant; skipping"
                        );
                        with_stats(&stats, |s| s.jobs_rejected += 1);
                        continue;
                    }
                    run_one(&harness, &worker, job, &stats).await;
                }
                continue;
            }
            Err(e) => {
                error!(worker = %worker, error = %e, "failed to claim jobs");
                with_stats(&stats, |s| s.store_errors += 1);
                config.poll_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!(worker = %worker, "job worker stopped");
}

async fn run_one<S: JobStore>(
    harness: &ExecutionHarness<S>,
    worker: &WorkerId,
    job: Job,
    stats: &Mutex<ExecutorStats>,
) {
    with_stats(stats, |s| s.current_running += 1);
    let job_id = job.job_id;
    let report = harness.execute(job).await;

    with_stats(stats, |s| {
        s.current_running = s.current_running.saturating_sub(1);
        s.jobs_processed += 1;
        match &report {
            Ok(r) => match r.result {
                ExecutionResult::Completed => s.jobs_succeeded += 1,
                ExecutionResult::Retrying { .. } => s.jobs_retried += 1,
                ExecutionResult::DeadLettered { .. } => s.jobs_dead_lettered += 1,
                ExecutionResult::LeaseLost => s.leases_lost += 1,
            },
            Err(_) => s.store_errors += 1,
        }
    });

    if let Err(e) = report {
        error!(worker = %worker, job_id = %job_id, error = %e, "failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::clock::{Clock, ManualClock};
    use crate::config::QueueConfig;
    use crate::events::RecordingEventSink;
    use crate::store::InMemoryJobStore;
    use crate::types::{JobCategory, JobStatus, NewJob};
    use quotecash_core::TenantId;

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    struct Fixture {
        harness: ExecutionHarness<InMemoryJobStore>,
        clock: ManualClock,
        events: Arc<RecordingEventSink>,
        tenant: TenantId,
    }

    fn fixture(registry: HandlerRegistry, handler_timeout: Duration) -> Fixture {
        fixture_with(handler_timeout, |_, _| registry)
    }

    /// Fixture whose handlers can reach the queue and clock.
    fn fixture_with(
        handler_timeout: Duration,
        build: impl FnOnce(&JobQueue<InMemoryJobStore>, &ManualClock) -> HandlerRegistry,
    ) -> Fixture {
        let events = Arc::new(RecordingEventSink::new());
        let clock = ManualClock::starting_now();
        let config = QueueConfig::default().with_handler_timeout(handler_timeout);
        let queue = JobQueue::new(InMemoryJobStore::arc(), config)
            .with_clock(Arc::new(clock.clone()))
            .with_event_sink(events.clone());
        let registry = build(&queue, &clock);
        Fixture {
            harness: ExecutionHarness::new(queue, registry),
            clock,
            events,
            tenant: test_tenant(),
        }
    }

    async fn claimed(f: &Fixture, job_type: &str) -> Job {
        f.harness
            .queue()
            .enqueue(NewJob::new(
                f.tenant,
                JobCategory::Notifications,
                job_type,
                format!("{job_type}:1"),
                serde_json::json!({"to": "ops@example.com"}),
            ))
            .await
            .unwrap();
        f.harness
            .queue()
            .claim(&ClaimRequest::new(WorkerId::new("w1")))
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn success_stores_result() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("notify", |_| async {
            Outcome::success_with(serde_json::json!({"delivered": true}))
        });
        let f = fixture(registry, Duration::from_secs(5));
        let job = claimed(&f, "notify").await;

        let report = f.harness.execute(job.clone()).await.unwrap();
        assert_eq!(report.result, ExecutionResult::Completed);

        let stored = f.harness.queue().get(f.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(serde_json::json!({"delivered": true})));
        assert!(stored.completed_at.is_some());
        assert_eq!(f.events.of_kind(JobEventKind::JobCompleted).len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_type_is_dead_lettered() {
        let f = fixture(HandlerRegistry::new(), Duration::from_secs(5));
        let job = claimed(&f, "mystery").await;

        let report = f.harness.execute(job).await.unwrap();
        assert!(matches!(
            report.result,
            ExecutionResult::DeadLettered {
                reason: DeadLetterReason::NonRetryable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn panic_is_contained_and_retryable() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |ctx| async move {
            if ctx.attempt > 0 {
                panic!("template missing");
            }
            Outcome::success()
        });
        let f = fixture(registry, Duration::from_secs(5));
        let job = claimed(&f, "boom").await;

        let report = f.harness.execute(job.clone()).await.unwrap();
        assert!(matches!(
            report.result,
            ExecutionResult::Retrying {
                error_class: ErrorClass::Retryable,
                ..
            }
        ));
        let stored = f.harness.queue().get(f.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("template missing"));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Outcome::success()
        });
        let f = fixture(registry, Duration::from_millis(20));
        let job = claimed(&f, "slow").await;

        let report = f.harness.execute(job).await.unwrap();
        assert!(matches!(
            report.result,
            ExecutionResult::Retrying {
                error_class: ErrorClass::Transient,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failure_messages_are_redacted() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("notify", |ctx| async move {
            let to = ctx.payload["to"].as_str().unwrap_or_default().to_string();
            Outcome::retryable(format!("mailbox {to} unavailable\nretry later"))
        });
        let f = fixture(registry, Duration::from_secs(5));
        let job = claimed(&f, "notify").await;

        f.harness.execute(job.clone()).await.unwrap();
        let stored = f.harness.queue().get(f.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(
            stored.last_error.as_deref(),
            Some("mailbox [redacted] unavailable retry later")
        );
        assert!(f.events.events().iter().all(|e| e.job_type == "notify"));
    }

    #[tokio::test]
    async fn huge_retry_hint_is_capped() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("notify", |_| async {
            Outcome::rate_limited("429 from provider", Some(Duration::MAX))
        });
        let f = fixture(registry, Duration::from_secs(5));
        let job = claimed(&f, "notify").await;

        let report = f.harness.execute(job.clone()).await.unwrap();
        let ExecutionResult::Retrying { next_retry_at, .. } = report.result else {
            panic!("expected retry, got {:?}", report.result);
        };
        let cap = f.harness.queue().config().retry.max_retry_after;
        let stored = f.harness.queue().get(f.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.next_retry_at, Some(next_retry_at));
        assert_eq!(
            next_retry_at - f.clock.now(),
            chrono::TimeDelta::from_std(cap).unwrap()
        );
    }

    #[tokio::test]
    async fn reclaimed_job_is_not_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = fixture_with(Duration::from_secs(5), |_, _| {
            let mut registry = HandlerRegistry::new();
            let calls = calls.clone();
            registry.register_fn("notify", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Outcome::success() }
            });
            registry
        });
        let stale = claimed(&f, "notify").await;

        // Another worker reclaims after the lease runs out.
        f.clock
            .advance(f.harness.queue().config().lease_timeout + Duration::from_secs(1));
        let fresh = f
            .harness
            .queue()
            .claim(&ClaimRequest::new(WorkerId::new("w2")))
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(fresh.job_id, stale.job_id);

        let report = f.harness.execute(stale).await.unwrap();
        assert_eq!(report.result, ExecutionResult::LeaseLost);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let lost = f.events.of_kind(JobEventKind::JobLeaseLost);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].duration, Some(Duration::ZERO));
        assert_eq!(lost[0].worker_id, Some(WorkerId::new("w1")));
    }

    #[tokio::test]
    async fn lease_lost_while_running_emits_one_event() {
        let f = fixture_with(Duration::from_secs(5), |queue, clock| {
            let mut registry = HandlerRegistry::new();
            let queue = queue.clone();
            let clock = clock.clone();
            registry.register_fn("notify", move |_| {
                let queue = queue.clone();
                let clock = clock.clone();
                async move {
                    // The run outlives the lease and a second worker takes over.
                    clock.advance(queue.config().lease_timeout + Duration::from_secs(1));
                    let taken = queue
                        .claim(&ClaimRequest::new(WorkerId::new("w2")))
                        .await
                        .unwrap();
                    assert_eq!(taken.len(), 1);
                    Outcome::success()
                }
            });
            registry
        });
        let job = claimed(&f, "notify").await;

        let report = f.harness.execute(job.clone()).await.unwrap();
        assert_eq!(report.result, ExecutionResult::LeaseLost);

        let stored = f.harness.queue().get(f.tenant, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.claimed_by_worker, Some(WorkerId::new("w2")));

        let lost = f.events.of_kind(JobEventKind::JobLeaseLost);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].job_id, Some(job.job_id));
        assert_eq!(lost[0].duration, Some(report.duration));
        assert!(f.events.of_kind(JobEventKind::JobCompleted).is_empty());
    }

    #[test]
    fn panic_payloads_are_stringified() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }
}
