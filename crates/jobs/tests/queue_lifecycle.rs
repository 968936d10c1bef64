use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use quotecash_core::{TenantId, UserId};
use quotecash_jobs::{
    ClaimRequest, DeadLetterFilter, DeadLetterReason, ErrorClass, ExecutionHarness,
    ExecutionResult, HandlerRegistry, InMemoryJobStore, Job, JobCategory, JobError,
    JobEventKind, JobFilter, JobQueue, JobStatus, ManualClock, NewJob, Outcome, QueueConfig,
    RecordingEventSink, ReprocessStatus, RetryPolicy, WorkerId,
};

const SYNC_JOB: &str = "accounting.sync_invoice";

struct Fixture {
    queue: JobQueue<InMemoryJobStore>,
    clock: ManualClock,
    events: Arc<RecordingEventSink>,
}

fn test_tenant() -> TenantId {
    TenantId::new()
}

fn fixture() -> Fixture {
    quotecash_observability::init_for_tests();
    let clock = ManualClock::starting_now();
    let events = Arc::new(RecordingEventSink::new());
    let config = QueueConfig::default()
        .with_lease_timeout(Duration::from_secs(60))
        .with_handler_timeout(Duration::from_secs(5))
        .with_retry(
            RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30))
                .with_jitter_ratio(0.0),
        );
    let queue = JobQueue::new(InMemoryJobStore::arc(), config)
        .with_clock(Arc::new(clock.clone()))
        .with_event_sink(events.clone());
    Fixture {
        queue,
        clock,
        events,
    }
}

impl Fixture {
    fn clock_now(&self, plus_secs: i64) -> chrono::DateTime<chrono::Utc> {
        use quotecash_jobs::Clock;
        self.clock.now() + chrono::TimeDelta::seconds(plus_secs)
    }
}

fn sync_job(tenant_id: TenantId, key: &str) -> NewJob {
    NewJob::new(
        tenant_id,
        JobCategory::Sync,
        SYNC_JOB,
        key,
        serde_json::json!({ "invoice_id": key }),
    )
}

async fn claim_one(queue: &JobQueue<InMemoryJobStore>, worker: &str) -> Option<Job> {
    queue
        .claim(&ClaimRequest::new(WorkerId::new(worker)))
        .await
        .unwrap()
        .into_iter()
        .next()
}

/// Handler that fails transiently until `healthy` is set.
fn flaky_registry(healthy: Arc<AtomicBool>, calls: Arc<AtomicU32>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, move |_ctx| {
        let healthy = healthy.clone();
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if healthy.load(Ordering::SeqCst) {
                Outcome::success_with(serde_json::json!({ "synced": true }))
            } else {
                Outcome::transient("upstream accounting API unavailable")
            }
        }
    });
    registry
}

#[tokio::test]
async fn duplicate_enqueue_returns_existing_job() {
    let f = fixture();
    let tenant = test_tenant();

    let first = f.queue.enqueue(sync_job(tenant, "sync:inv-1")).await.unwrap();
    let second = f.queue.enqueue(sync_job(tenant, "sync:inv-1")).await.unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.job.job_id, second.job.job_id);

    let jobs = f.queue.list(&JobFilter::new(tenant)).await.unwrap();
    assert_eq!(jobs.len(), 1);

    let enqueued = f.events.of_kind(JobEventKind::JobEnqueued);
    assert_eq!(enqueued.len(), 2);
    assert!(enqueued[1].duplicate);
}

#[tokio::test]
async fn cancelling_frees_the_idempotency_key() {
    let f = fixture();
    let tenant = test_tenant();

    let first = f.queue.enqueue(sync_job(tenant, "sync:inv-2")).await.unwrap();
    let cancelled = f.queue.cancel(tenant, first.job.job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let again = f.queue.enqueue(sync_job(tenant, "sync:inv-2")).await.unwrap();
    assert!(!again.duplicate);
    assert_ne!(again.job.job_id, first.job.job_id);

    let err = f.queue.cancel(tenant, first.job.job_id).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition(_)));
}

#[tokio::test]
async fn enqueue_rejects_invalid_input() {
    let f = fixture();

    let err = f
        .queue
        .enqueue(sync_job(test_tenant(), ""))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let err = f
        .queue
        .enqueue(sync_job(test_tenant(), "sync:inv-3").with_priority(10))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let f = fixture();
    let tenant_a = test_tenant();
    let tenant_b = test_tenant();

    let a = f.queue.enqueue(sync_job(tenant_a, "sync:shared")).await.unwrap();
    let b = f.queue.enqueue(sync_job(tenant_b, "sync:shared")).await.unwrap();
    assert!(!b.duplicate);
    assert_ne!(a.job.job_id, b.job.job_id);

    assert!(f.queue.get(tenant_b, a.job.job_id).await.unwrap().is_none());
    let err = f.queue.cancel(tenant_b, a.job.job_id).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));

    let claimed = f
        .queue
        .claim(
            &ClaimRequest::new(WorkerId::new("tenant-b-worker"))
                .for_tenant(tenant_b)
                .with_batch_size(10),
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].tenant_id, tenant_b);

    assert_eq!(f.queue.stats(tenant_a).await.unwrap().pending, 1);
    assert_eq!(f.queue.stats(tenant_b).await.unwrap().processing, 1);
}

#[tokio::test]
async fn claim_respects_priority_schedule_and_category() {
    let f = fixture();
    let tenant = test_tenant();

    f.queue
        .enqueue(sync_job(tenant, "low").with_priority(8))
        .await
        .unwrap();
    let urgent = f
        .queue
        .enqueue(sync_job(tenant, "urgent").with_priority(1))
        .await
        .unwrap();
    f.queue
        .enqueue(
            sync_job(tenant, "later")
                .with_priority(0)
                .scheduled_at(f.clock_now(60)),
        )
        .await
        .unwrap();
    f.queue
        .enqueue(NewJob::new(
            tenant,
            JobCategory::Documents,
            "documents.render_pdf",
            "pdf:q-1",
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let first = f
        .queue
        .claim(&ClaimRequest::new(WorkerId::new("w")).with_categories([JobCategory::Sync]))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].job_id, urgent.job.job_id);
    assert_eq!(first[0].attempt_count, 1);

    let rest = f
        .queue
        .claim(
            &ClaimRequest::new(WorkerId::new("w"))
                .with_categories([JobCategory::Sync])
                .with_batch_size(10),
        )
        .await
        .unwrap();
    let keys: Vec<_> = rest.iter().map(|j| j.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["low"]);

    f.clock.advance(Duration::from_secs(61));
    let later = claim_one(&f.queue, "w").await.unwrap();
    assert_eq!(later.idempotency_key, "later");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() {
    let f = fixture();
    let tenant = test_tenant();
    for i in 0..60 {
        f.queue
            .enqueue(sync_job(tenant, &format!("sync:bulk-{i}")))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let queue = f.queue.clone();
        tasks.push(tokio::spawn(async move {
            let request = ClaimRequest::new(WorkerId::new(format!("w-{w}"))).with_batch_size(3);
            let mut claimed = Vec::new();
            loop {
                let batch = queue.claim(&request).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|j| j.job_id));
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 60);
    assert_eq!(unique.len(), 60);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_late_result_dropped() {
    let f = fixture();
    let tenant = test_tenant();
    let calls = Arc::new(AtomicU32::new(0));
    let harness = ExecutionHarness::new(
        f.queue.clone(),
        flaky_registry(Arc::new(AtomicBool::new(true)), calls.clone()),
    );

    let enqueued = f.queue.enqueue(sync_job(tenant, "sync:slow")).await.unwrap();
    let stale = claim_one(&f.queue, "worker-a").await.unwrap();
    assert_eq!(stale.attempt_count, 1);

    // Not yet expired.
    f.clock.advance(Duration::from_secs(30));
    assert!(claim_one(&f.queue, "worker-b").await.is_none());

    f.clock.advance(Duration::from_secs(31));
    let fresh = claim_one(&f.queue, "worker-b").await.unwrap();
    assert_eq!(fresh.job_id, enqueued.job.job_id);
    assert_eq!(fresh.attempt_count, 1);
    assert_eq!(fresh.claimed_by_worker, Some(WorkerId::new("worker-b")));

    // The stale holder's run is refused before its handler starts.
    let late = harness.execute(stale).await.unwrap();
    assert_eq!(late.result, ExecutionResult::LeaseLost);
    let lost = f.events.of_kind(JobEventKind::JobLeaseLost);
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].job_id, Some(enqueued.job.job_id));
    assert_eq!(lost[0].worker_id, Some(WorkerId::new("worker-a")));
    assert!(lost[0].duration.is_some());

    let report = harness.execute(fresh).await.unwrap();
    assert_eq!(report.result, ExecutionResult::Completed);

    let job = f.queue.get(tenant, enqueued.job.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!({ "synced": true })));
    assert!(job.claimed_by_worker.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.events.of_kind(JobEventKind::JobCompleted).len(), 1);
}

#[tokio::test]
async fn retries_back_off_and_dead_letter_after_budget() {
    let f = fixture();
    let tenant = test_tenant();
    let healthy = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));
    let harness = ExecutionHarness::new(f.queue.clone(), flaky_registry(healthy.clone(), calls.clone()));

    let enqueued = f
        .queue
        .enqueue(sync_job(tenant, "sync:inv-9").with_max_attempts(3))
        .await
        .unwrap();
    let job_id = enqueued.job.job_id;

    let mut delays = Vec::new();
    for attempt in 1..=2u32 {
        let job = claim_one(&f.queue, "w").await.unwrap();
        assert_eq!(job.attempt_count, attempt);
        let started = job.claimed_at.unwrap();

        let report = harness.execute(job).await.unwrap();
        let ExecutionResult::Retrying {
            error_class,
            next_retry_at,
        } = report.result
        else {
            panic!("expected retry, got {:?}", report.result);
        };
        assert_eq!(error_class, ErrorClass::Transient);
        delays.push(next_retry_at - started);

        // Not claimable before its retry time.
        assert!(claim_one(&f.queue, "w").await.is_none());
        f.clock.advance(Duration::from_secs(30));
    }
    assert_eq!(delays[0], chrono::TimeDelta::seconds(1));
    assert_eq!(delays[1], chrono::TimeDelta::seconds(2));

    let last = claim_one(&f.queue, "w").await.unwrap();
    assert_eq!(last.attempt_count, 3);
    let report = harness.execute(last).await.unwrap();
    let ExecutionResult::DeadLettered { entry_id, reason } = report.result else {
        panic!("expected dead letter, got {:?}", report.result);
    };
    assert_eq!(reason, DeadLetterReason::ExhaustedRetries);

    let job = f.queue.get(tenant, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt_count, 3);

    let entries = f
        .queue
        .dead_letters()
        .list(&DeadLetterFilter::new(tenant))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.entry_id, entry_id);
    assert_eq!(entry.original_job_id, job_id);
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.error_class, ErrorClass::Transient);
    assert_eq!(entry.reprocess_status, ReprocessStatus::PendingReview);
    assert_eq!(entry.correlation_id, enqueued.job.correlation_id);

    assert_eq!(f.queue.stats(tenant).await.unwrap().dead_letters_pending_review, 1);
    assert_eq!(f.events.of_kind(JobEventKind::JobFailed).len(), 2);
    assert_eq!(f.events.of_kind(JobEventKind::JobDeadLettered).len(), 1);

    // Reprocess after the upstream recovers; success resolves the entry.
    healthy.store(true, Ordering::SeqCst);
    let operator = UserId::new();
    let reprocessed = f
        .queue
        .dead_letters()
        .reprocess(tenant, entry_id, operator)
        .await
        .unwrap();
    assert_eq!(reprocessed.status, JobStatus::Pending);
    assert_eq!(reprocessed.idempotency_key, "sync:inv-9:reprocess:1");
    assert_eq!(reprocessed.reprocessed_from, Some(entry_id));
    assert_eq!(reprocessed.attempt_count, 0);
    assert_eq!(reprocessed.max_attempts, 3);

    let err = f
        .queue
        .dead_letters()
        .reprocess(tenant, entry_id, operator)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition(_)));

    let job = claim_one(&f.queue, "w").await.unwrap();
    assert_eq!(job.job_id, reprocessed.job_id);
    let report = harness.execute(job).await.unwrap();
    assert_eq!(report.result, ExecutionResult::Completed);

    let entry = f
        .queue
        .dead_letters()
        .get(tenant, entry_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.reprocess_status, ReprocessStatus::Resolved);
    assert_eq!(entry.new_job_id, Some(reprocessed.job_id));
    assert_eq!(entry.reviewed_by, Some(operator));
    assert_eq!(f.events.of_kind(JobEventKind::DeadLetterResolved).len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn non_retryable_failure_skips_retries() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async {
        Outcome::non_retryable("invoice customer does not exist in accounting system")
    });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    let enqueued = f
        .queue
        .enqueue(sync_job(tenant, "sync:inv-10").with_max_attempts(5))
        .await
        .unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    let report = harness.execute(job).await.unwrap();
    assert!(matches!(
        report.result,
        ExecutionResult::DeadLettered {
            reason: DeadLetterReason::NonRetryable,
            ..
        }
    ));

    let job = f.queue.get(tenant, enqueued.job.job_id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.error_class, Some(ErrorClass::NonRetryable));
}

#[tokio::test]
async fn rate_limited_failure_honors_retry_after() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async {
        Outcome::rate_limited("429 Too Many Requests", Some(Duration::from_secs(120)))
    });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    f.queue.enqueue(sync_job(tenant, "sync:inv-11")).await.unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    let claimed_at = job.claimed_at.unwrap();
    let report = harness.execute(job).await.unwrap();

    let ExecutionResult::Retrying {
        error_class,
        next_retry_at,
    } = report.result
    else {
        panic!("expected retry, got {:?}", report.result);
    };
    assert_eq!(error_class, ErrorClass::RateLimited);
    assert!(next_retry_at - claimed_at >= chrono::TimeDelta::seconds(120));
}

#[tokio::test]
async fn failed_reprocessing_reuses_the_entry() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async { Outcome::non_retryable("still broken") });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    f.queue.enqueue(sync_job(tenant, "sync:inv-12")).await.unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    let ExecutionResult::DeadLettered { entry_id, .. } = harness.execute(job).await.unwrap().result
    else {
        panic!("expected dead letter");
    };

    let dlq = f.queue.dead_letters();
    let reprocessed = dlq.reprocess(tenant, entry_id, UserId::new()).await.unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    assert_eq!(job.job_id, reprocessed.job_id);
    let ExecutionResult::DeadLettered {
        entry_id: again, ..
    } = harness.execute(job).await.unwrap().result
    else {
        panic!("expected dead letter");
    };
    assert_eq!(again, entry_id);

    let entries = dlq.list(&DeadLetterFilter::new(tenant)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reprocess_status, ReprocessStatus::PendingReview);
    assert_eq!(entries[0].reprocess_generation, 1);
    assert_eq!(entries[0].last_error, "still broken");

    // Second generation gets its own key.
    let second = dlq.reprocess(tenant, entry_id, UserId::new()).await.unwrap();
    assert_eq!(second.idempotency_key, "sync:inv-12:reprocess:2");

    let discarded = dlq
        .discard(tenant, entry_id, UserId::new(), Some("customer deleted".into()))
        .await;
    assert!(matches!(discarded, Err(JobError::InvalidTransition(_))));
}

#[tokio::test]
async fn reprocess_steps_past_a_producer_owned_key() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async { Outcome::non_retryable("bad mapping") });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    f.queue.enqueue(sync_job(tenant, "sync:inv-13")).await.unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    let ExecutionResult::DeadLettered { entry_id, .. } = harness.execute(job).await.unwrap().result
    else {
        panic!("expected dead letter");
    };

    // A producer happens to use the key the first reprocess would derive.
    let squatter = f
        .queue
        .enqueue(sync_job(tenant, "sync:inv-13:reprocess:1"))
        .await
        .unwrap();

    let dlq = f.queue.dead_letters();
    let reprocessed = dlq.reprocess(tenant, entry_id, UserId::new()).await.unwrap();
    assert_eq!(reprocessed.idempotency_key, "sync:inv-13:reprocess:2");
    assert_ne!(reprocessed.job_id, squatter.job.job_id);

    let entry = dlq.get(tenant, entry_id).await.unwrap().unwrap();
    assert_eq!(entry.reprocess_status, ReprocessStatus::Reprocessing);
    assert_eq!(entry.reprocess_generation, 2);
    assert_eq!(entry.new_job_id, Some(reprocessed.job_id));
}

#[tokio::test]
async fn reprocess_keys_respect_the_length_limit() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async { Outcome::non_retryable("bad mapping") });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    let long_key = "s".repeat(quotecash_jobs::types::MAX_IDEMPOTENCY_KEY_LEN);
    f.queue.enqueue(sync_job(tenant, &long_key)).await.unwrap();
    let job = claim_one(&f.queue, "w").await.unwrap();
    let ExecutionResult::DeadLettered { entry_id, .. } = harness.execute(job).await.unwrap().result
    else {
        panic!("expected dead letter");
    };

    let reprocessed = f
        .queue
        .dead_letters()
        .reprocess(tenant, entry_id, UserId::new())
        .await
        .unwrap();
    assert!(reprocessed.idempotency_key.len() <= quotecash_jobs::types::MAX_IDEMPOTENCY_KEY_LEN);
    assert!(reprocessed.idempotency_key.ends_with(":reprocess:1"));
}

#[tokio::test]
async fn operator_can_discard_or_resolve_pending_entries() {
    let f = fixture();
    let tenant = test_tenant();
    let mut registry = HandlerRegistry::new();
    registry.register_fn(SYNC_JOB, |_ctx| async { Outcome::non_retryable("bad payload") });
    let harness = ExecutionHarness::new(f.queue.clone(), registry);

    let mut entry_ids = Vec::new();
    for key in ["sync:a", "sync:b"] {
        f.queue.enqueue(sync_job(tenant, key)).await.unwrap();
        let job = claim_one(&f.queue, "w").await.unwrap();
        if let ExecutionResult::DeadLettered { entry_id, .. } = harness.execute(job).await.unwrap().result {
            entry_ids.push(entry_id);
        }
    }
    assert_eq!(entry_ids.len(), 2);

    let dlq = f.queue.dead_letters();
    let operator = UserId::new();
    let discarded = dlq
        .discard(tenant, entry_ids[0], operator, Some("duplicate invoice".into()))
        .await
        .unwrap();
    assert_eq!(discarded.reprocess_status, ReprocessStatus::Discarded);
    assert_eq!(discarded.review_note.as_deref(), Some("duplicate invoice"));

    let resolved = dlq.resolve(tenant, entry_ids[1], operator, None).await.unwrap();
    assert_eq!(resolved.reprocess_status, ReprocessStatus::Resolved);

    let err = dlq.reprocess(tenant, entry_ids[0], operator).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidTransition(_)));

    let err = dlq.reprocess(test_tenant(), entry_ids[1], operator).await.unwrap_err();
    assert!(matches!(err, JobError::DeadLetterNotFound(_)));

    let pending = dlq
        .list(&DeadLetterFilter::new(tenant).with_status(ReprocessStatus::PendingReview))
        .await
        .unwrap();
    assert!(pending.is_empty());
    assert_eq!(f.events.of_kind(JobEventKind::DeadLetterDiscarded).len(), 1);
}
