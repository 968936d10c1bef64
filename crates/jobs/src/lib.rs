//! `quotecash-jobs`: tenant-scoped durable job queue.
//!
//! Producers enqueue idempotently keyed jobs through [`JobQueue`]; a
//! [`WorkerPool`] claims them under time-limited leases, dispatches them to
//! handlers registered in a [`HandlerRegistry`] and records the outcome.
//! Failures are classified, retried with capped exponential backoff and
//! eventually archived in the dead-letter queue ([`DeadLetterManager`]) for
//! operator review.
//!
//! Storage is pluggable via [`JobStore`]:
//! - [`InMemoryJobStore`] for tests and single-process use
//! - [`PostgresJobStore`] for production (`SKIP LOCKED` claims, lease CAS)

/// Generates `ALL`, `as_str`, `Display` and `FromStr` for a snake_case enum
/// whose string form is persisted.
macro_rules! string_enum {
    ($t:ident, $label:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl ::std::fmt::Display for $t {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $t {
            type Err = ::quotecash_core::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err(::quotecash_core::DomainError::validation(format!(
                        "unknown {}: {}", $label, other
                    ))),
                }
            }
        }
    };
}

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod queue;
pub mod redact;
pub mod retry;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, QueueConfig, WorkerConfig};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterManager, DeadLetterReason, ReprocessStatus,
};
pub use error::JobError;
pub use events::{JobEvent, JobEventKind, JobEventSink, RecordingEventSink, TracingEventSink};
pub use executor::{
    ExecutionHarness, ExecutionReport, ExecutionResult, ExecutorStats, WorkerHandle, WorkerPool,
};
pub use handler::{FnHandler, HandlerContext, HandlerRegistry, JobHandler, Outcome};
pub use queue::{Enqueued, JobQueue};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use store::{
    ClaimRequest, Completion, InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError,
    PostgresJobStore, Review, ReviewTransition,
};
pub use types::{
    DeadLetterId, ErrorClass, Job, JobCategory, JobFailure, JobId, JobStatus, Lease, NewJob,
    WorkerId,
};
