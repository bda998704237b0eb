//! Operator-facing listener, kept off the client port so probes and
//! scrapes are never rate limited or routed.
//!
//! - `GET /health`, `GET /ready` from [`health_router`]
//! - `GET /metrics` as OpenMetrics text

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use luki_core::config::AdminConfig;
use luki_core::lifecycle::{LifecycleManager, health_router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::StartupError;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

pub struct AdminServer {
    bind: String,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
}

impl AdminServer {
    pub fn new(config: &AdminConfig, lifecycle: Arc<LifecycleManager>, registry: Arc<Registry>) -> Self {
        Self {
            bind: format!("{}:{}", config.bind, config.port),
            lifecycle,
            registry,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind
    }

    pub fn router(&self) -> Router {
        let metrics = Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(Arc::clone(&self.registry));
        health_router(Arc::clone(&self.lifecycle)).merge(metrics)
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), StartupError> {
        let listener = tokio::net::TcpListener::bind(&self.bind)
            .await
            .map_err(|source| StartupError::Bind {
                addr: self.bind.clone(),
                source,
            })?;
        let local: SocketAddr = listener.local_addr()?;
        info!(addr = %local, "Admin listener bound");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("Admin listener closed");
        Ok(())
    }
}

async fn render_metrics(State(registry): State<Arc<Registry>>) -> Response {
    let mut text = String::new();
    match encode(&mut text, &registry) {
        Ok(()) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
