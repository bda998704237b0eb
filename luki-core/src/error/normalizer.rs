//! The single exit mapping from [`GatewayError`] to what a caller sees.

use http::StatusCode;

use super::{ErrorEnvelope, GatewayError};

/// A failure ready to be written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
    /// Value for a `Retry-After` header, in whole seconds.
    pub retry_after_secs: Option<u64>,
    /// Metrics label of the underlying failure.
    pub reason: &'static str,
}

impl NormalizedError {
    /// Normalize `err` for the request identified by `trace_id`.
    pub fn new(err: &GatewayError, trace_id: &str) -> Self {
        Self {
            status: err.status(),
            envelope: err.normalize(trace_id),
            retry_after_secs: err.retry_after_secs(),
            reason: err.error_type_name(),
        }
    }

    pub fn code(&self) -> &str {
        &self.envelope.error.code
    }
}
