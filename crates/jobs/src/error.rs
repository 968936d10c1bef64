//! Public error type of the job queue API.

use thiserror::Error;

use quotecash_core::DomainError;

use crate::store::JobStoreError;
use crate::types::{DeadLetterId, JobId};

/// Errors returned by [`JobQueue`](crate::JobQueue), the
/// [`DeadLetterManager`](crate::DeadLetterManager) and the execution harness.
///
/// Handler failures never show up here; they are recorded on the job. Only
/// caller mistakes and store-level failures propagate.
#[derive(Debug, Error)]
pub enum JobError {
    /// Enqueue input was rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// The requested action is not allowed from the current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The caller's lease was reclaimed by another worker; its result was dropped.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    /// The store failed; callers should treat this as a health signal.
    #[error("job store failure: {0}")]
    Store(JobStoreError),
}

impl JobError {
    /// Whether the error originates in the store rather than in the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, JobError::Store(_))
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            JobStoreError::DeadLetterNotFound(id) => JobError::DeadLetterNotFound(id),
            JobStoreError::LeaseLost(id) => JobError::LeaseLost(id),
            JobStoreError::InvalidTransition(msg) => JobError::InvalidTransition(msg),
            other => JobError::Store(other),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            DomainError::Conflict(msg) => JobError::InvalidTransition(msg),
        }
    }
}
