//! `quotecash-core`: shared primitives for the quote-to-cash platform.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the domain error model and tenant scoping.

pub mod error;
pub mod id;
pub mod tenant;

pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, TenantId, UserId};
pub use tenant::TenantScoped;
