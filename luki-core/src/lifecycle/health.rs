//! `GET /health` (liveness) and `GET /ready` (readiness).
//!
//! Liveness only fails once the process has stopped; a draining gateway is
//! still alive. Readiness fails while starting, while draining, and while a
//! `required` downstream's last probe was neither healthy nor degraded.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use super::{LifecycleManager, Phase};

/// Why `/ready` answers 503.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    Starting,
    ConfigNotLoaded,
    ShuttingDown,
    /// Named required downstream is unhealthy or not probed yet.
    DownstreamDown(String),
}

impl NotReady {
    fn reason(&self) -> String {
        match self {
            Self::Starting => "starting".to_string(),
            Self::ConfigNotLoaded => "config_not_loaded".to_string(),
            Self::ShuttingDown => "shutting_down".to_string(),
            Self::DownstreamDown(name) => format!("downstream_unavailable: {name}"),
        }
    }
}

pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(lifecycle)
}

async fn liveness(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let phase = lifecycle.phase();
    let (status, label) = if phase == Phase::Stopped {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = json!({
        "status": label,
        "phase": phase,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": lifecycle.uptime().as_secs(),
    });
    (status, Json(body)).into_response()
}

async fn readiness(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let downstreams = lifecycle.probes();

    match lifecycle.readiness() {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "downstreams": downstreams })),
        )
            .into_response(),
        Err(not_ready) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": not_ready.reason(),
                "downstreams": downstreams,
            })),
        )
            .into_response(),
    }
}
