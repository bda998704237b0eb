//! HTTP client for one downstream service.
//!
//! A [`DownstreamClient`] owns a pooled `reqwest::Client`, a bounded slot
//! pool with a bounded wait queue, and the [`CircuitBreaker`] for its
//! downstream. Every attempt asks the breaker first; an open breaker fails
//! the call before any I/O.
//!
//! # Retries
//!
//! Only requests marked idempotent are retried, with exponential backoff
//! from the descriptor's `backoff_base`. A retry is never started when the
//! backoff would run past the caller's deadline, and never when the breaker
//! has opened in the meantime. Client errors (4xx) are returned at once.
//!
//! # Streams
//!
//! [`DownstreamClient::open_stream`] returns an [`EventStream`] decoded from
//! the downstream's SSE body. The pool slot travels with the stream. So does
//! the breaker permit, unless it is the half-open probe: a probe settles as
//! soon as the 2xx headers arrive, and a later break is counted through
//! [`CircuitBreaker::record_failure`]. Otherwise the completion marker
//! reports success, a broken stream reports failure, and dropping the stream
//! early reports neither.

pub mod sse;

pub use sse::{SseDecoder, SseFrame};

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{Method, StatusCode};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::breaker::{BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::config::DownstreamDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::telemetry::GatewayMetrics;

/// Header carrying the correlation id in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest unary response body accepted from a downstream.
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One outbound call.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    /// Path relative to the descriptor's base URL.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub body: Option<serde_json::Value>,
    pub correlation_id: String,
    /// Whether failed attempts may be retried.
    pub idempotent: bool,
}

impl DownstreamRequest {
    /// A non-idempotent JSON POST.
    pub fn post(
        path: impl Into<String>,
        body: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: None,
            body: Some(body),
            correlation_id: correlation_id.into(),
            idempotent: false,
        }
    }

    /// An idempotent GET.
    pub fn get(
        path: impl Into<String>,
        query: Option<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query,
            body: None,
            correlation_id: correlation_id.into(),
            idempotent: true,
        }
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// Successful (2xx) unary response.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: StatusCode,
    /// Parsed JSON body. Empty bodies are `Null`; non-JSON text is kept as
    /// a JSON string.
    pub body: serde_json::Value,
}

/// Event read from a downstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    Done,
}

/// Downstream event stream. Ends after `Done` or after the first error.
pub type EventStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamEvent>> + Send>>;

/// Health classification for one downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Reachable, but the breaker is not closed or the health endpoint
    /// answered with a non-2xx status.
    Degraded,
    Unhealthy,
    /// Not checked yet.
    Unknown,
}

/// Result of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct DownstreamHealth {
    pub name: String,
    pub status: HealthStatus,
    pub breaker: BreakerSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Seam between the dispatcher and the transport.
///
/// Implemented by [`DownstreamClient`]; tests substitute in-process fakes.
#[async_trait]
pub trait Downstream: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<DownstreamResponse>;

    async fn open_stream(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<EventStream>;

    async fn health_check(&self) -> DownstreamHealth;
}

/// Pooled, breaker-guarded client for one downstream.
pub struct DownstreamClient {
    name: String,
    descriptor: DownstreamDescriptor,
    client: Client,
    breaker: Arc<CircuitBreaker>,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl DownstreamClient {
    /// Build the client and its breaker from a descriptor.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the TLS backend cannot be initialized.
    pub fn new(name: impl Into<String>, descriptor: DownstreamDescriptor) -> GatewayResult<Self> {
        let name = name.into();
        let client = Client::builder()
            .connect_timeout(descriptor.connect_timeout)
            .pool_max_idle_per_host(descriptor.max_idle)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                GatewayError::internal(format!("failed to build HTTP client for '{name}': {e}"))
            })?;

        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            descriptor.failure_threshold,
            descriptor.cooldown,
        ));
        let slots = Arc::new(Semaphore::new(descriptor.max_connections.max(1)));

        Ok(Self {
            name,
            descriptor,
            client,
            breaker,
            slots,
            waiting: AtomicUsize::new(0),
            metrics: None,
        })
    }

    /// Attach metrics.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        metrics.set_breaker_state(&self.name, self.breaker.state());
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &DownstreamDescriptor {
        &self.descriptor
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Requests currently waiting for a pool slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Send a unary request, retrying idempotent failures within `deadline`.
    #[tracing::instrument(
        skip(self, request, deadline),
        fields(
            downstream = %self.name,
            method = %request.method,
            path = %request.path,
            correlation_id = %request.correlation_id,
        )
    )]
    pub async fn call(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<DownstreamResponse> {
        let max_attempts = if request.idempotent {
            self.descriptor.max_retries.saturating_add(1)
        } else {
            1
        };
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            if let Some(previous) = &last_error {
                let backoff = self.backoff(attempt);
                if Instant::now() + backoff >= deadline {
                    warn!(
                        attempt,
                        error = %previous,
                        "Deadline leaves no room for another attempt"
                    );
                    return Err(self.timeout_error());
                }
                warn!(
                    attempt,
                    max_retries = self.descriptor.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %previous,
                    "Downstream attempt failed, retrying"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry(&self.name);
                }
                tokio::time::sleep(backoff).await;
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(rejected) => {
                    self.record_attempt("rejected", 0.0);
                    return Err(last_error.unwrap_or(rejected));
                }
            };
            let _slot = self.acquire_slot(deadline).await?;

            match self.attempt(&request, permit, deadline).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_downstream_failure() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| self.timeout_error()))
    }

    /// Open an event stream. Streams are never retried.
    #[tracing::instrument(
        skip(self, request, deadline),
        fields(
            downstream = %self.name,
            path = %request.path,
            correlation_id = %request.correlation_id,
        )
    )]
    pub async fn open_stream(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<EventStream> {
        let permit = self.breaker.try_acquire().inspect_err(|_| {
            self.record_attempt("rejected", 0.0);
        })?;
        let slot = self.acquire_slot(deadline).await?;

        let started = Instant::now();
        let budget = self.attempt_budget(started, deadline);
        let builder = self
            .request_builder(&request)
            .header(http::header::ACCEPT, "text/event-stream");

        let response = match tokio::time::timeout(budget, builder.send()).await {
            Err(_) => {
                permit.failure();
                self.finish_attempt("timeout", started);
                return Err(self.timeout_error());
            }
            Ok(Err(e)) => {
                permit.failure();
                let err = self.classify_error(&e);
                self.finish_attempt(outcome_label(&err), started);
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            if status.is_server_error() {
                permit.failure();
            } else {
                permit.success();
            }
            self.finish_attempt(status.as_str(), started);
            return Err(GatewayError::DownstreamError {
                downstream: self.name.clone(),
                status: status.as_u16(),
            });
        }
        let permit = if permit.is_probe() {
            permit.success();
            None
        } else {
            Some(permit)
        };
        self.finish_attempt(status.as_str(), started);
        debug!("Downstream stream opened");

        let state = StreamState {
            body: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            permit,
            slot: Some(slot),
            breaker: Arc::clone(&self.breaker),
            metrics: self.metrics.clone(),
            eof: false,
            finished: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            state,
            StreamState::next_event,
        )))
    }

    /// Probe the downstream's health endpoint. Bypasses the breaker.
    #[tracing::instrument(skip(self), fields(downstream = %self.name))]
    pub async fn health_check(&self) -> DownstreamHealth {
        let url = self.descriptor.url_for(&self.descriptor.health_path);
        let timeout = self.descriptor.timeout.min(HEALTH_CHECK_TIMEOUT);
        let breaker = self.breaker.snapshot();

        let (status, detail) = match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => match breaker.state {
                BreakerState::Closed => (HealthStatus::Healthy, None),
                state => (
                    HealthStatus::Degraded,
                    Some(format!("circuit breaker {state}")),
                ),
            },
            Ok(response) => (
                HealthStatus::Degraded,
                Some(format!("health endpoint returned {}", response.status())),
            ),
            Err(e) => (
                HealthStatus::Unhealthy,
                Some(self.classify_error(&e).to_string()),
            ),
        };

        DownstreamHealth {
            name: self.name.clone(),
            status,
            breaker,
            detail,
        }
    }

    async fn attempt(
        &self,
        request: &DownstreamRequest,
        permit: BreakerPermit,
        deadline: Instant,
    ) -> GatewayResult<DownstreamResponse> {
        let started = Instant::now();
        let budget = self.attempt_budget(started, deadline);
        if budget.is_zero() {
            return Err(self.timeout_error());
        }

        let result = match tokio::time::timeout(budget, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        };

        match result {
            Err(e) => {
                permit.failure();
                self.finish_attempt(outcome_label(&e), started);
                Err(e)
            }
            Ok((status, _)) if !status.is_success() => {
                if status.is_server_error() {
                    permit.failure();
                } else {
                    permit.success();
                }
                self.finish_attempt(status.as_str(), started);
                Err(GatewayError::DownstreamError {
                    downstream: self.name.clone(),
                    status: status.as_u16(),
                })
            }
            Ok((status, body)) => {
                permit.success();
                self.finish_attempt(status.as_str(), started);
                Ok(DownstreamResponse {
                    status,
                    body: parse_body(&body),
                })
            }
        }
    }

    async fn send(&self, request: &DownstreamRequest) -> GatewayResult<(StatusCode, Bytes)> {
        let response = self
            .request_builder(request)
            .send()
            .await
            .map_err(|e| self.classify_error(&e))?;
        let status = response.status();
        let body = self.read_body_limited(response, &request.correlation_id).await?;
        Ok((status, body))
    }

    fn request_builder(&self, request: &DownstreamRequest) -> reqwest::RequestBuilder {
        let mut url = self.descriptor.url_for(&request.path);
        if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let builder = self
            .client
            .request(request.method.clone(), url)
            .header(REQUEST_ID_HEADER, &request.correlation_id);
        match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    /// Read a response body, enforcing [`MAX_RESPONSE_SIZE`].
    ///
    /// Oversized bodies are reported as a bad-gateway downstream error.
    async fn read_body_limited(
        &self,
        mut response: reqwest::Response,
        correlation_id: &str,
    ) -> GatewayResult<Bytes> {
        let too_large = || GatewayError::DownstreamError {
            downstream: self.name.clone(),
            status: StatusCode::BAD_GATEWAY.as_u16(),
        };

        if let Some(content_length) = response.content_length() {
            if content_length as usize > MAX_RESPONSE_SIZE {
                warn!(
                    correlation_id = %correlation_id,
                    content_length,
                    max_response_size = MAX_RESPONSE_SIZE,
                    "Downstream response exceeds size limit (Content-Length)"
                );
                return Err(too_large());
            }
        }

        let mut buf = Vec::with_capacity(
            response
                .content_length()
                .map(|cl| cl as usize)
                .unwrap_or(8192)
                .min(MAX_RESPONSE_SIZE),
        );
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "Failed to read downstream response body"
            );
            self.classify_error(&e)
        })? {
            if buf.len() + chunk.len() > MAX_RESPONSE_SIZE {
                warn!(
                    correlation_id = %correlation_id,
                    max_response_size = MAX_RESPONSE_SIZE,
                    "Downstream response exceeds size limit (streaming)"
                );
                return Err(too_large());
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(buf))
    }

    /// Take a pool slot, waiting in the bounded queue if all are busy.
    async fn acquire_slot(&self, deadline: Instant) -> GatewayResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => return Ok(slot),
            Err(TryAcquireError::Closed) => {
                return Err(GatewayError::internal("downstream slot pool closed"));
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let ahead = self.waiting.fetch_add(1, Ordering::AcqRel);
        let _queued = QueueTicket(&self.waiting);
        if ahead >= self.descriptor.max_queue {
            if let Some(metrics) = &self.metrics {
                metrics.record_rejection("downstream_saturated");
            }
            warn!(
                downstream = %self.name,
                max_connections = self.descriptor.max_connections,
                max_queue = self.descriptor.max_queue,
                "Downstream pool and wait queue full"
            );
            return Err(GatewayError::DownstreamSaturated {
                downstream: self.name.clone(),
            });
        }

        match tokio::time::timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(GatewayError::internal("downstream slot pool closed")),
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn attempt_budget(&self, now: Instant, deadline: Instant) -> Duration {
        deadline
            .saturating_duration_since(now)
            .min(self.descriptor.timeout)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.descriptor.backoff_base.saturating_mul(1 << exponent)
    }

    fn classify_error(&self, e: &reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            self.timeout_error()
        } else {
            GatewayError::DownstreamConnection {
                downstream: self.name.clone(),
                reason: e.to_string(),
            }
        }
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::DownstreamTimeout {
            downstream: self.name.clone(),
        }
    }

    fn finish_attempt(&self, outcome: &str, started: Instant) {
        self.record_attempt(outcome, started.elapsed().as_secs_f64() * 1000.0);
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(&self.name, self.breaker.state());
        }
    }

    fn record_attempt(&self, outcome: &str, elapsed_ms: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_downstream_attempt(&self.name, outcome, elapsed_ms);
        }
    }
}

#[async_trait]
impl Downstream for DownstreamClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<DownstreamResponse> {
        DownstreamClient::call(self, request, deadline).await
    }

    async fn open_stream(
        &self,
        request: DownstreamRequest,
        deadline: Instant,
    ) -> GatewayResult<EventStream> {
        DownstreamClient::open_stream(self, request, deadline).await
    }

    async fn health_check(&self) -> DownstreamHealth {
        DownstreamClient::health_check(self).await
    }
}

/// Decrements the wait-queue length when a waiter leaves.
struct QueueTicket<'a>(&'a AtomicUsize);

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct StreamState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    permit: Option<BreakerPermit>,
    slot: Option<OwnedSemaphorePermit>,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<GatewayMetrics>>,
    eof: bool,
    finished: bool,
}

impl StreamState {
    async fn next_event(mut self) -> Option<(GatewayResult<StreamEvent>, Self)> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(frame) = self.pending.pop_front() {
                let item = match frame {
                    SseFrame::Token(text) => Ok(StreamEvent::Token(text)),
                    SseFrame::Done => {
                        self.settle(true);
                        Ok(StreamEvent::Done)
                    }
                    SseFrame::Error(message) => {
                        self.settle(false);
                        Err(GatewayError::StreamError {
                            reason: format!("downstream reported: {message}"),
                        })
                    }
                };
                return Some((item, self));
            }

            if self.eof {
                self.settle(false);
                let err = GatewayError::StreamError {
                    reason: "downstream closed the stream without a completion marker"
                        .to_string(),
                };
                return Some((Err(err), self));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    let frames = self.decoder.feed(&chunk);
                    self.pending.extend(frames);
                }
                Some(Err(e)) => {
                    self.settle(false);
                    let err = GatewayError::StreamError {
                        reason: e.to_string(),
                    };
                    return Some((Err(err), self));
                }
                None => {
                    self.eof = true;
                    let frames = self.decoder.finish();
                    self.pending.extend(frames);
                }
            }
        }
    }

    fn settle(&mut self, success: bool) {
        self.finished = true;
        self.slot.take();
        match self.permit.take() {
            Some(permit) if success => permit.success(),
            Some(permit) => permit.failure(),
            None if !success => self.breaker.record_failure(),
            None => {}
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(self.breaker.name(), self.breaker.state());
        }
    }
}

fn parse_body(body: &[u8]) -> serde_json::Value {
    if body.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn outcome_label(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::DownstreamTimeout { .. } => "timeout",
        GatewayError::DownstreamConnection { .. } => "connect_error",
        _ => "error",
    }
}
