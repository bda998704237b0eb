//! Process phase, in-flight request accounting and downstream health.
//!
//! ```text
//! Starting → Ready → Draining → Stopped
//! ```
//!
//! Handlers take a [`RequestGuard`] for every request (and keep it inside
//! streaming bodies) so that [`LifecycleManager::drain_requests`] can wait
//! for the last one without polling. Probe results are cached here; the
//! readiness endpoint reads the cache and never performs I/O itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::downstream::{Downstream, DownstreamHealth, HealthStatus};
use crate::telemetry::GatewayMetrics;

pub mod health;

pub use health::{NotReady, health_router};

// ============================================================================
// Phase
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Ready,
    /// New requests are refused; in-flight ones are finishing.
    Draining,
    Stopped,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for in-flight requests at shutdown.
    pub drain_timeout: Duration,
    /// Period of the downstream health monitor.
    pub health_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(25),
            health_interval: Duration::from_secs(30),
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub fn from_server_config(server: &ServerConfig) -> Self {
        Self {
            health_interval: server.health_interval,
            ..Self::default()
        }
    }
}

// ============================================================================
// Probe records
// ============================================================================

/// Last known health of one downstream.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub required: bool,
    pub status: HealthStatus,
    #[serde(skip)]
    pub checked_at: Option<Instant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeRecord {
    fn unprobed(required: bool) -> Self {
        Self {
            required,
            status: HealthStatus::Unknown,
            checked_at: None,
            detail: None,
        }
    }

    /// A degraded downstream still answers, so it does not block readiness.
    fn blocks_readiness(&self) -> bool {
        self.required && !matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Shared by the HTTP handlers, the admin server and background tasks.
pub struct LifecycleManager {
    phase: AtomicU8,
    config_loaded: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown: CancellationToken,
    probes: DashMap<String, ProbeRecord>,
    metrics: ArcSwapOption<GatewayMetrics>,
    config: LifecycleConfig,
    booted_at: Instant,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Starting as u8),
            config_loaded: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
            probes: DashMap::new(),
            metrics: ArcSwapOption::empty(),
            config,
            booted_at: Instant::now(),
        }
    }

    /// Attach metrics once the registry exists.
    pub fn set_metrics(&self, metrics: Arc<GatewayMetrics>) {
        self.metrics.store(Some(metrics));
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Draining or stopped.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self.phase(), Phase::Draining | Phase::Stopped)
    }

    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::Release);
    }

    pub fn mark_ready(&self) {
        self.set_phase(Phase::Ready);
        info!(
            version = env!("CARGO_PKG_VERSION"),
            boot_ms = self.booted_at.elapsed().as_millis() as u64,
            "Gateway ready"
        );
    }

    /// Stop admitting requests and cancel every task holding the token.
    pub fn begin_shutdown(&self) {
        self.set_phase(Phase::Draining);
        self.shutdown.cancel();
        info!(in_flight = self.active_request_count(), "Shutdown started");
    }

    pub fn mark_stopped(&self) {
        self.set_phase(Phase::Stopped);
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.booted_at.elapsed()
    }

    // ------------------------------------------------------------------------
    // In-flight requests
    // ------------------------------------------------------------------------

    /// Count a request until the returned guard is dropped.
    ///
    /// `None` once draining has begun.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_draining() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(RequestGuard {
            lifecycle: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no request is in flight, or `drain_timeout` passes.
    pub async fn drain_requests(&self) -> DrainResult {
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            // Register before reading the counter so a release in between
            // is not missed.
            idle.as_mut().enable();

            let remaining = self.active_request_count();
            if remaining == 0 {
                return DrainResult::Complete;
            }
            debug!(remaining, "Waiting for in-flight requests");

            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let remaining = self.active_request_count();
                if remaining == 0 {
                    return DrainResult::Complete;
                }
                warn!(remaining, "Drain deadline passed with requests in flight");
                return DrainResult::Timeout { remaining };
            }
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    // ------------------------------------------------------------------------
    // Downstream health
    // ------------------------------------------------------------------------

    /// Track a downstream as unprobed.
    pub fn register_downstream(&self, name: &str, required: bool) {
        self.probes
            .insert(name.to_string(), ProbeRecord::unprobed(required));
    }

    /// Store a probe result. Status changes are logged.
    pub fn record_probe(&self, health: &DownstreamHealth) {
        let previous = {
            let mut record = self
                .probes
                .entry(health.name.clone())
                .or_insert_with(|| ProbeRecord::unprobed(false));
            let previous = record.status;
            record.status = health.status;
            record.checked_at = Some(Instant::now());
            record.detail = health.detail.clone();
            previous
        };

        if let Some(metrics) = self.metrics.load().as_ref() {
            metrics.set_breaker_state(&health.name, health.breaker.state);
        }

        if previous != health.status {
            let detail = health.detail.as_deref().unwrap_or_default();
            match health.status {
                HealthStatus::Healthy => info!(downstream = %health.name, "Downstream healthy"),
                HealthStatus::Unknown => {}
                status => warn!(downstream = %health.name, ?status, detail, "Downstream not healthy"),
            }
        }
    }

    /// Snapshot of every tracked downstream, ordered by name.
    #[must_use]
    pub fn probes(&self) -> BTreeMap<String, ProbeRecord> {
        self.probes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// `Ok` when the gateway should receive traffic.
    pub fn readiness(&self) -> Result<(), NotReady> {
        match self.phase() {
            Phase::Draining | Phase::Stopped => return Err(NotReady::ShuttingDown),
            Phase::Starting => return Err(NotReady::Starting),
            Phase::Ready => {}
        }
        if !self.config_loaded.load(Ordering::Acquire) {
            return Err(NotReady::ConfigNotLoaded);
        }
        if let Some(entry) = self.probes.iter().find(|e| e.value().blocks_readiness()) {
            return Err(NotReady::DownstreamDown(entry.key().clone()));
        }
        Ok(())
    }

    /// Probe every downstream immediately, then every `health_interval`,
    /// until shutdown.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        downstreams: Vec<Arc<dyn Downstream>>,
    ) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let results = futures_util::future::join_all(
                            downstreams.iter().map(|d| d.health_check()),
                        )
                        .await;
                        for health in &results {
                            lifecycle.record_probe(health);
                        }
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }
}

/// Keeps one request counted as in flight.
pub struct RequestGuard {
    lifecycle: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle.release();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}
