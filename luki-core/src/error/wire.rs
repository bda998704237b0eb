//! Wire shape for normalized errors.
//!
//! Every error leaving the gateway, whether as a unary response body or as
//! the terminal frame of an event stream, has this shape:
//!
//! ```json
//! {"error": {"code": "RATE_LIMIT_EXCEEDED", "message": "...", "trace_id": "..."}}
//! ```

use serde::{Deserialize, Serialize};

/// Outer error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

/// Error object inside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (SCREAMING_SNAKE)
    pub code: String,

    /// Human-readable message, safe for callers
    pub message: String,

    /// Correlation id of the request that failed
    pub trace_id: String,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: &str) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                trace_id: trace_id.to_string(),
            },
        }
    }
}
