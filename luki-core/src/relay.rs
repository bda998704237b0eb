//! Token-by-token relay from a downstream event stream to a client.
//!
//! The relay is the producer half of a producer/consumer pair joined by an
//! `mpsc` channel of capacity one. It pulls one event from the downstream,
//! hands it to the channel, and only pulls the next once the slot is free,
//! so at most one event is buffered between the two sides.
//!
//! The relay ends in exactly one of four ways:
//!
//! | Trigger                     | Client receives        | Outcome              |
//! |-----------------------------|------------------------|----------------------|
//! | downstream completion       | `Done`                 | `Completed`          |
//! | downstream error or EOF     | `Error` (`STREAM_ERROR`) | `DownstreamFailed` |
//! | client gone / cancelled     | nothing                | `ClientDisconnected` |
//! | max duration elapsed        | `Error` (`STREAM_TIMEOUT`) | `TimedOut`       |
//!
//! Returning drops the downstream stream, which closes its connection and
//! frees the pool slot.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::downstream::{EventStream, StreamEvent};
use crate::error::{ErrorEnvelope, GatewayError};
use crate::telemetry::GatewayMetrics;

/// How long a terminal error frame may wait for a slow client.
const TERMINAL_FRAME_GRACE: Duration = Duration::from_secs(1);

/// Frame delivered to the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Token(String),
    Done,
    Error(ErrorEnvelope),
}

/// Why a relay ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed { events: u64 },
    DownstreamFailed(GatewayError),
    ClientDisconnected,
    TimedOut,
}

impl RelayOutcome {
    /// Metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::DownstreamFailed(_) => "downstream_failed",
            Self::ClientDisconnected => "client_disconnected",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Stream forwarding with a hard duration cap.
#[derive(Clone)]
pub struct StreamRelay {
    max_duration: Duration,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl StreamRelay {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Start relaying on a background task.
    ///
    /// The returned [`StreamSession`] yields frames for the client. Dropping
    /// it cancels the relay and the downstream read.
    pub fn spawn(&self, events: EventStream, trace_id: String) -> StreamSession {
        let (sink, frames) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let relay = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            relay.relay(events, sink, token, &trace_id).await;
        });

        StreamSession {
            frames,
            _cancel: cancel.drop_guard(),
        }
    }

    /// Forward `events` into `sink` until one of the terminal conditions.
    pub async fn relay(
        &self,
        events: EventStream,
        sink: mpsc::Sender<RelayFrame>,
        cancel: CancellationToken,
        trace_id: &str,
    ) -> RelayOutcome {
        let started = Instant::now();
        let _active = ActiveStream::new(self.metrics.clone());
        let mut forwarded: u64 = 0;

        // `pump` owns the downstream stream, so it is closed on return.
        let outcome = pump(
            events,
            &sink,
            &cancel,
            started + self.max_duration,
            trace_id,
            &mut forwarded,
        )
        .await;

        if outcome == RelayOutcome::TimedOut {
            let err = GatewayError::StreamTimeout {
                limit: self.max_duration,
            };
            deliver_terminal(&sink, RelayFrame::Error(err.normalize(trace_id))).await;
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(metrics) = &self.metrics {
            metrics.record_stream(outcome.as_str(), duration_ms);
        }
        match &outcome {
            RelayOutcome::Completed { events } => info!(
                correlation_id = %trace_id,
                events,
                duration_ms,
                "Stream completed"
            ),
            RelayOutcome::DownstreamFailed(err) => warn!(
                correlation_id = %trace_id,
                forwarded,
                error = %err,
                "Stream failed mid-flight"
            ),
            RelayOutcome::ClientDisconnected => debug!(
                correlation_id = %trace_id,
                forwarded,
                "Client disconnected, downstream read cancelled"
            ),
            RelayOutcome::TimedOut => warn!(
                correlation_id = %trace_id,
                forwarded,
                limit_secs = self.max_duration.as_secs(),
                "Stream exceeded maximum duration"
            ),
        }

        outcome
    }
}

async fn pump(
    mut events: EventStream,
    sink: &mpsc::Sender<RelayFrame>,
    cancel: &CancellationToken,
    expires_at: Instant,
    trace_id: &str,
    forwarded: &mut u64,
) -> RelayOutcome {
    let expiry = tokio::time::sleep_until(expires_at);
    tokio::pin!(expiry);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::ClientDisconnected,
            _ = sink.closed() => return RelayOutcome::ClientDisconnected,
            _ = &mut expiry => return RelayOutcome::TimedOut,
            next = events.next() => next,
        };

        let (frame, terminal) = match next {
            Some(Ok(StreamEvent::Token(text))) => (RelayFrame::Token(text), None),
            Some(Ok(StreamEvent::Done)) => (
                RelayFrame::Done,
                Some(RelayOutcome::Completed { events: *forwarded }),
            ),
            Some(Err(err)) => {
                let frame = RelayFrame::Error(err.normalize(trace_id));
                (frame, Some(RelayOutcome::DownstreamFailed(err)))
            }
            None => {
                let err = GatewayError::StreamError {
                    reason: "downstream stream ended without completion".to_string(),
                };
                let frame = RelayFrame::Error(err.normalize(trace_id));
                (frame, Some(RelayOutcome::DownstreamFailed(err)))
            }
        };

        if let Some(outcome) = terminal {
            // Stop reading the downstream before the final hand-off.
            drop(events);
            deliver_terminal(sink, frame).await;
            return outcome;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::ClientDisconnected,
            _ = &mut expiry => return RelayOutcome::TimedOut,
            sent = sink.send(frame) => {
                if sent.is_err() {
                    return RelayOutcome::ClientDisconnected;
                }
                *forwarded += 1;
            }
        }
    }
}

async fn deliver_terminal(sink: &mpsc::Sender<RelayFrame>, frame: RelayFrame) {
    if tokio::time::timeout(TERMINAL_FRAME_GRACE, sink.send(frame))
        .await
        .is_err()
    {
        debug!("Client did not accept the terminal frame in time");
    }
}

/// Client side of a running relay.
///
/// Yields frames in downstream order and ends after the terminal frame.
pub struct StreamSession {
    frames: mpsc::Receiver<RelayFrame>,
    _cancel: DropGuard,
}

impl Stream for StreamSession {
    type Item = RelayFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx)
    }
}

/// Keeps the active-streams gauge in step with relay lifetimes.
struct ActiveStream(Option<Arc<GatewayMetrics>>);

impl ActiveStream {
    fn new(metrics: Option<Arc<GatewayMetrics>>) -> Self {
        if let Some(m) = &metrics {
            m.streams_active.inc();
        }
        Self(metrics)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        if let Some(m) = &self.0 {
            m.streams_active.dec();
        }
    }
}
