//! Error taxonomy for the request path.
//!
//! Every failure raised by a pipeline stage is a [`GatewayError`]. The HTTP
//! layer never renders these directly; it goes through
//! [`GatewayError::normalize`] so the wire body is identical regardless of
//! which stage failed.
//!
//! ## Module Organization
//!
//! - `wire` - the stable `{"error": {code, message, trace_id}}` body
//! - `normalizer` - status, body and `Retry-After` for one failure

pub mod normalizer;
pub mod wire;

pub use normalizer::NormalizedError;
pub use wire::{ErrorBody, ErrorEnvelope};

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Result alias used across the dispatch core.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All failures that can end a request.
///
/// The `Display` text is for logs only and may include downstream names and
/// transport details. Callers see [`GatewayError::public_message`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Missing, malformed or rejected credential.
    #[error("unauthenticated: {reason}")]
    Unauthenticated {
        /// Why the credential was rejected
        reason: String,
    },

    /// Valid credential without the scopes the route requires.
    #[error("forbidden: missing scopes {missing:?}")]
    Forbidden {
        /// Scopes the identity lacks
        missing: Vec<String>,
    },

    /// The external credential verifier could not be reached.
    ///
    /// Requests fail closed: nothing is forwarded when this happens.
    #[error("auth service unavailable: {reason}")]
    AuthServiceUnavailable {
        /// Transport-level reason
        reason: String,
    },

    /// The caller's token bucket did not hold enough tokens.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Time until the bucket holds enough tokens again
        retry_after: Duration,
    },

    /// Request body or parameters failed validation.
    #[error("validation failed: {details}")]
    ValidationError {
        /// Caller-facing description of the problem
        details: String,
    },

    /// Circuit breaker for the downstream is open; no I/O was attempted.
    #[error("downstream '{downstream}' unavailable (circuit open)")]
    DownstreamUnavailable {
        /// Downstream name
        downstream: String,
    },

    /// Network failure talking to the downstream.
    #[error("cannot connect to downstream '{downstream}': {reason}")]
    DownstreamConnection {
        /// Downstream name
        downstream: String,
        /// Transport-level reason
        reason: String,
    },

    /// The downstream's connection pool and wait queue are both full.
    #[error("downstream '{downstream}' saturated")]
    DownstreamSaturated {
        /// Downstream name
        downstream: String,
    },

    /// The downstream did not answer before the request deadline.
    #[error("downstream '{downstream}' timed out")]
    DownstreamTimeout {
        /// Downstream name
        downstream: String,
    },

    /// The downstream answered with a non-2xx status.
    #[error("downstream '{downstream}' returned status {status}")]
    DownstreamError {
        /// Downstream name
        downstream: String,
        /// HTTP status returned by the downstream
        status: u16,
    },

    /// The downstream event stream broke mid-flight.
    #[error("stream error: {reason}")]
    StreamError {
        /// What went wrong
        reason: String,
    },

    /// A stream ran past its maximum duration.
    #[error("stream exceeded maximum duration of {limit:?}")]
    StreamTimeout {
        /// Configured maximum stream duration
        limit: Duration,
    },

    /// No route matches the request path and method.
    #[error("no route for {method} {path}")]
    NotFound {
        /// Request method
        method: String,
        /// Request path
        path: String,
    },

    /// The gateway is draining and refuses new work.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// Anything unexpected.
    #[error("internal error: {details}")]
    InternalError {
        /// Internal description (never sent to callers)
        details: String,
    },
}

impl GatewayError {
    /// Stable machine-readable error code sent on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "UNAUTHENTICATED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::AuthServiceUnavailable { .. } => "AUTH_SERVICE_UNAVAILABLE",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DownstreamUnavailable { .. } | Self::DownstreamConnection { .. } => {
                "DOWNSTREAM_UNAVAILABLE"
            }
            Self::DownstreamSaturated { .. } => "DOWNSTREAM_SATURATED",
            Self::DownstreamTimeout { .. } => "DOWNSTREAM_TIMEOUT",
            Self::DownstreamError { .. } => "DOWNSTREAM_ERROR",
            Self::StreamError { .. } => "STREAM_ERROR",
            Self::StreamTimeout { .. } => "STREAM_TIMEOUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ShuttingDown => "SERVICE_UNAVAILABLE",
            Self::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the normalized response.
    ///
    /// A downstream 4xx keeps its status so callers can tell a bad request
    /// forwarded by the agent from a gateway failure. Any other downstream
    /// status collapses to 502.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ValidationError { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AuthServiceUnavailable { .. }
            | Self::DownstreamUnavailable { .. }
            | Self::DownstreamConnection { .. }
            | Self::DownstreamSaturated { .. }
            | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::DownstreamTimeout { .. } | Self::StreamTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::DownstreamError { status, .. } => match StatusCode::from_u16(*status) {
                Ok(code) if code.is_client_error() => code,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::StreamError { .. } => StatusCode::BAD_GATEWAY,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Snake-case name used as a metrics label.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::AuthServiceUnavailable { .. } => "auth_service_unavailable",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::ValidationError { .. } => "validation_error",
            Self::DownstreamUnavailable { .. } => "downstream_unavailable",
            Self::DownstreamConnection { .. } => "downstream_connection",
            Self::DownstreamSaturated { .. } => "downstream_saturated",
            Self::DownstreamTimeout { .. } => "downstream_timeout",
            Self::DownstreamError { .. } => "downstream_error",
            Self::StreamError { .. } => "stream_error",
            Self::StreamTimeout { .. } => "stream_timeout",
            Self::NotFound { .. } => "not_found",
            Self::ShuttingDown => "shutting_down",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Whole seconds a client should wait before retrying, if any.
    ///
    /// Rounded up and never zero so a `Retry-After: 0` is not sent for a
    /// bucket that is a fraction of a token short.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after } => {
                let secs = retry_after.as_secs_f64().ceil() as u64;
                Some(secs.max(1))
            }
            _ => None,
        }
    }

    /// Message safe to show callers.
    ///
    /// Never includes downstream URLs, transport errors or internal details.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated { .. } => "Authentication required".to_string(),
            Self::Forbidden { missing } => {
                format!("Missing required scope(s): {}", missing.join(", "))
            }
            Self::AuthServiceUnavailable { .. } => {
                "Authentication service temporarily unavailable".to_string()
            }
            Self::RateLimitExceeded { .. } => {
                let secs = self.retry_after_secs().unwrap_or(1);
                format!("Rate limit exceeded, retry after {secs}s")
            }
            Self::ValidationError { details } => details.clone(),
            Self::DownstreamUnavailable { .. } | Self::DownstreamConnection { .. } => {
                "Service temporarily unavailable".to_string()
            }
            Self::DownstreamSaturated { .. } => {
                "Service is at capacity, try again shortly".to_string()
            }
            Self::DownstreamTimeout { .. } => "Service did not respond in time".to_string(),
            Self::DownstreamError { status, .. } => {
                format!("Service returned an error (status {status})")
            }
            Self::StreamError { .. } => "Stream interrupted".to_string(),
            Self::StreamTimeout { .. } => "Stream exceeded maximum duration".to_string(),
            Self::NotFound { .. } => "Not found".to_string(),
            Self::ShuttingDown => "Service is shutting down".to_string(),
            Self::InternalError { .. } => "Internal server error".to_string(),
        }
    }

    /// Map into the wire shape, tagged with the request's trace id.
    pub fn normalize(&self, trace_id: &str) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code(), self.public_message(), trace_id)
    }

    /// Whether the failure should count against a downstream's breaker.
    pub fn is_downstream_failure(&self) -> bool {
        match self {
            Self::DownstreamConnection { .. }
            | Self::DownstreamTimeout { .. }
            | Self::StreamError { .. } => true,
            Self::DownstreamError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn validation(details: impl Into<String>) -> Self {
        Self::ValidationError {
            details: details.into(),
        }
    }

    pub(crate) fn internal(details: impl Into<String>) -> Self {
        Self::InternalError {
            details: details.into(),
        }
    }
}
