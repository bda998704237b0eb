//! Per-downstream circuit breaker.
//!
//! ```text
//!            F consecutive failures          cooldown D elapsed
//!   Closed ─────────────────────────▶ Open ──────────────────────▶ HalfOpen
//!     ▲                                 ▲                             │
//!     │          probe succeeded        │       probe failed          │
//!     └─────────────────────────────────┼─────────────────────────────┤
//!                                       └─────────────────────────────┘
//! ```
//!
//! All state lives behind one mutex so a state read and the transition it
//! triggers are one step. The breaker never performs I/O; the downstream
//! client asks for a [`BreakerPermit`] before every attempt and reports the
//! outcome through it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::GatewayError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected without I/O until the cooldown elapses.
    Open,
    /// A single probe call is allowed through.
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding for the breaker-state gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_transition: Instant,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub seconds_since_transition: u64,
}

/// Failure-isolation state machine for one downstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// `failure_threshold` is clamped to at least 1.
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask whether a call may be attempted.
    ///
    /// Fails with `DownstreamUnavailable` while open, and while half-open
    /// with a probe already in flight.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, GatewayError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let probe = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|opened| now.saturating_duration_since(opened) >= self.cooldown);
                if !cooled {
                    return Err(self.unavailable());
                }
                self.transition(&mut inner, BreakerState::HalfOpen, now);
                inner.probe_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.unavailable());
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// Current state as stored. An open breaker whose cooldown has elapsed
    /// stays `Open` here until the next call asks for a permit.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call would be rejected right now without I/O.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => inner.probe_in_flight,
            BreakerState::Open => inner
                .opened_at
                .is_none_or(|opened| opened.elapsed() < self.cooldown),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            seconds_since_transition: inner.last_transition.elapsed().as_secs(),
        }
    }

    /// Count a failure that no permit is left to report, such as a stream
    /// breaking after its half-open probe already closed the breaker.
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Force the breaker open, as if the threshold had just been reached.
    #[cfg(test)]
    pub(crate) fn trip(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.opened_at = Some(now);
        inner.probe_in_flight = false;
        self.transition(&mut inner, BreakerState::Open, now);
    }

    fn on_success(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen if probe => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            // A call admitted before the breaker opened finished late.
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen if probe => {
                inner.opened_at = Some(now);
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
    }

    fn on_abandoned(&self, probe: bool) {
        if probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.last_transition = now;

        match to {
            BreakerState::Open => warn!(
                downstream = %self.name,
                from = %from,
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Circuit breaker opened"
            ),
            _ => info!(
                downstream = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state change"
            ),
        }
    }

    fn unavailable(&self) -> GatewayError {
        GatewayError::DownstreamUnavailable {
            downstream: self.name.clone(),
        }
    }
}

/// Permission to make one call, obtained from [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). A permit dropped without an outcome (the
/// caller was cancelled) releases a half-open probe slot without counting
/// as either.
#[must_use = "report the call outcome through the permit"]
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.probe);
        }
    }
}
