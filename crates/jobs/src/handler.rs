//! Handler registration.
//!
//! Handlers are looked up by `job_type` in an explicit registry built at
//! process start; there is no global state.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use quotecash_core::{CorrelationId, TenantId};

use crate::types::{ErrorClass, Job, JobCategory, JobId};

/// What a handler sees of a job: identity, routing and the opaque payload.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    pub job_type: String,
    pub category: JobCategory,
    pub payload: serde_json::Value,
    pub payload_version: u32,
    /// 1 on the first attempt.
    pub attempt: u32,
}

impl HandlerContext {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            tenant_id: job.tenant_id,
            correlation_id: job.correlation_id,
            job_type: job.job_type.clone(),
            category: job.category,
            payload: job.payload.clone(),
            payload_version: job.payload_version,
            attempt: job.attempt_count,
        }
    }

    /// Decode the payload; a payload that does not match `T` can never succeed,
    /// so the error maps to a non-retryable outcome.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Outcome> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Outcome::non_retryable(format!(
                "payload v{} does not decode: {e}",
                self.payload_version
            ))
        })
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job is done; the optional value is stored as the job result.
    Success(Option<serde_json::Value>),
    /// The attempt failed.
    Failure {
        class: ErrorClass,
        message: String,
        /// Minimum delay before the next attempt (e.g. from a `Retry-After` header).
        retry_after: Option<Duration>,
    },
}

impl Outcome {
    pub fn success() -> Self {
        Self::Success(None)
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        Self::Success(Some(result))
    }

    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Failure {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::failure(ErrorClass::Transient, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::failure(ErrorClass::Retryable, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::failure(ErrorClass::NonRetryable, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Failure {
            class: ErrorClass::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// A job handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &HandlerContext) -> Outcome;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext) -> Outcome {
        (self.f)(ctx.clone()).await
    }
}

/// Map from `job_type` to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register<H: JobHandler>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Register an async closure for a job type.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(job_type, FnHandler::new(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
