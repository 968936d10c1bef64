//! Job lifecycle events.
//!
//! Events carry identifiers, status and timing only, never payload content, so
//! sinks can forward them to logs or metrics without leaking customer data.

use std::fmt::{self, Debug};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use quotecash_core::{CorrelationId, TenantId, UserId};

use crate::dead_letter::DeadLetterEntry;
use crate::types::{DeadLetterId, ErrorClass, Job, JobId, JobStatus, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobEnqueued,
    JobClaimed,
    JobCompleted,
    JobFailed,
    /// The lease expired and was reclaimed before the outcome was recorded.
    JobLeaseLost,
    JobDeadLettered,
    DeadLetterReprocessed,
    DeadLetterDiscarded,
    DeadLetterResolved,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::JobEnqueued => "job_enqueued",
            JobEventKind::JobClaimed => "job_claimed",
            JobEventKind::JobCompleted => "job_completed",
            JobEventKind::JobFailed => "job_failed",
            JobEventKind::JobLeaseLost => "job_lease_lost",
            JobEventKind::JobDeadLettered => "job_dead_lettered",
            JobEventKind::DeadLetterReprocessed => "dead_letter_reprocessed",
            JobEventKind::DeadLetterDiscarded => "dead_letter_discarded",
            JobEventKind::DeadLetterResolved => "dead_letter_resolved",
        }
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content-free lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    pub job_id: Option<JobId>,
    pub entry_id: Option<DeadLetterId>,
    pub job_type: String,
    pub status: Option<JobStatus>,
    pub attempt_count: u32,
    pub error_class: Option<ErrorClass>,
    /// Handler run time for execution events, time since `scheduled_at` for
    /// `job_claimed` and job age for `job_enqueued`. Empty for operator actions.
    pub duration: Option<Duration>,
    /// Enqueue returned an existing job.
    pub duplicate: bool,
    pub worker_id: Option<WorkerId>,
    pub operator: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn for_job(kind: JobEventKind, job: &Job, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            tenant_id: job.tenant_id,
            correlation_id: job.correlation_id,
            job_id: Some(job.job_id),
            entry_id: None,
            job_type: job.job_type.clone(),
            status: Some(job.status),
            attempt_count: job.attempt_count,
            error_class: job.error_class,
            duration: None,
            duplicate: false,
            worker_id: job.claimed_by_worker.clone(),
            operator: None,
            occurred_at: at,
        }
    }

    pub fn for_entry(kind: JobEventKind, entry: &DeadLetterEntry, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            tenant_id: entry.tenant_id,
            correlation_id: entry.correlation_id,
            job_id: None,
            entry_id: Some(entry.entry_id),
            job_type: entry.job_type.clone(),
            status: None,
            attempt_count: entry.attempt_count,
            error_class: Some(entry.error_class),
            duration: None,
            duplicate: false,
            worker_id: None,
            operator: None,
            occurred_at: at,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_entry(mut self, entry_id: DeadLetterId) -> Self {
        self.entry_id = Some(entry_id);
        self
    }

    pub fn with_operator(mut self, operator: UserId) -> Self {
        self.operator = Some(operator);
        self
    }
}

/// Receiver of job lifecycle events.
///
/// Called inline on the worker task; implementations must not block.
pub trait JobEventSink: Send + Sync + Debug {
    fn emit(&self, event: &JobEvent);
}

/// Default sink: one structured `tracing` event per lifecycle event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl JobEventSink for TracingEventSink {
    fn emit(&self, event: &JobEvent) {
        let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();
        let entry_id = event.entry_id.map(|id| id.to_string()).unwrap_or_default();
        let status = event.status.map(|s| s.as_str()).unwrap_or_default();
        let error_class = event.error_class.map(|c| c.as_str()).unwrap_or_default();
        let duration_ms = event.duration.map(|d| d.as_millis() as u64).unwrap_or_default();

        match event.kind {
            JobEventKind::JobFailed
            | JobEventKind::JobLeaseLost
            | JobEventKind::JobDeadLettered => warn!(
                event = %event.kind,
                tenant_id = %event.tenant_id,
                correlation_id = %event.correlation_id,
                job_id = %job_id,
                entry_id = %entry_id,
                job_type = %event.job_type,
                status = %status,
                attempt_count = event.attempt_count,
                error_class = %error_class,
                duration_ms,
                "job event"
            ),
            _ => info!(
                event = %event.kind,
                tenant_id = %event.tenant_id,
                correlation_id = %event.correlation_id,
                job_id = %job_id,
                entry_id = %entry_id,
                job_type = %event.job_type,
                status = %status,
                attempt_count = event.attempt_count,
                duplicate = event.duplicate,
                duration_ms,
                "job event"
            ),
        }
    }
}

/// Sink that keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<JobEventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// Events of one kind, in emission order.
    pub fn of_kind(&self, kind: JobEventKind) -> Vec<JobEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl JobEventSink for RecordingEventSink {
    fn emit(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
