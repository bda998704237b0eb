//! Error types for the HTTP layer.

use std::io;

use axum::Json;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use luki_core::config::ConfigError;
use luki_core::{GatewayError, NormalizedError};
use thiserror::Error;

/// A normalized failure on its way to the client.
///
/// Writes the `{"error": {...}}` envelope with the mapped status, plus
/// `Retry-After` for rate-limit rejections.
#[derive(Debug)]
pub struct ApiError(pub NormalizedError);

impl ApiError {
    /// Normalize an error raised by the HTTP layer itself.
    pub fn from_gateway(err: &GatewayError, trace_id: &str) -> Self {
        Self(NormalizedError::new(err, trace_id))
    }
}

impl From<NormalizedError> for ApiError {
    fn from(err: NormalizedError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let NormalizedError {
            status,
            envelope,
            retry_after_secs,
            ..
        } = self.0;

        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Fatal errors during process startup.
///
/// None of these are recoverable: the gateway exits without accepting
/// connections.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A downstream client could not be built (bad TLS or base URL).
    #[error("cannot build client for downstream '{name}': {source}")]
    Downstream {
        name: String,
        #[source]
        source: GatewayError,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rate_limit_response_has_retry_after() {
        let err = GatewayError::RateLimitExceeded {
            retry_after: Duration::from_millis(2500),
        };
        let response = ApiError::from_gateway(&err, "req-1").into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(json["error"]["trace_id"], "req-1");
    }

    #[tokio::test]
    async fn test_internal_details_not_exposed() {
        let err = GatewayError::InternalError {
            details: "panic at src/secret.rs:42".into(),
        };
        let response = ApiError::from_gateway(&err, "req-2").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("secret.rs"));
    }
}
