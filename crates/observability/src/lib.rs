//! Tracing and logging setup shared by every binary and test suite.

/// Initialize process-wide observability (tracing/logging).
///
/// The output format is taken from `QUOTECASH_LOG_FORMAT` (`json` when unset).
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use self::tracing::{LogFormat, init_for_tests, init_with};
