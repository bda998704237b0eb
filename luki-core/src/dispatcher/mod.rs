//! Per-request orchestration.
//!
//! Every request runs the same fixed sequence of stages:
//!
//! 1. `authenticate` - credential to [`Identity`]
//! 2. `authorize` - identity scopes against the route's scopes
//! 3. `rate_limit` - debit the caller's token bucket
//! 4. `invoke` - call the route's downstream, directly or via [`StreamRelay`]
//!
//! Each stage takes the immutable [`RequestContext`] and returns a
//! `GatewayResult`. The first failure short-circuits: later stages never run
//! and no downstream is contacted. The failure leaves [`Dispatcher::dispatch`]
//! as a [`NormalizedError`], which is the only error shape callers see.

pub mod chat;
pub mod context;

pub use chat::{ChatMessage, ChatRequest};
pub use context::{Admission, RequestContext, correlation_id_from};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use http::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, Identity};
use crate::config::{
    Config, ConfigError, RateLimitKeyStrategy, RateLimitScope, RouteConfig, RouteKind,
};
use crate::downstream::{Downstream, DownstreamRequest};
use crate::error::{GatewayError, GatewayResult, NormalizedError};
use crate::limiter::{LimitDecision, TokenBucketLimiter};
use crate::relay::{StreamRelay, StreamSession};
use crate::telemetry::GatewayMetrics;

/// What a successful dispatch hands back to the HTTP layer.
pub enum DispatchOutput {
    Json { status: StatusCode, body: Value },
    Stream(StreamSession),
}

impl std::fmt::Debug for DispatchOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Dispatched {
    pub output: DispatchOutput,
    /// Tokens left in the caller's bucket, for `X-RateLimit-Remaining`.
    pub rate_limit_remaining: Option<u32>,
}

/// The orchestration core shared by every request handler.
pub struct Dispatcher {
    config: Arc<Config>,
    auth: AuthGate,
    limiter: Option<Arc<TokenBucketLimiter>>,
    downstreams: HashMap<String, Arc<dyn Downstream>>,
    relay: StreamRelay,
    routes: Vec<RouteConfig>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Dispatcher {
    /// Build a dispatcher over the given downstreams.
    ///
    /// Fails if a route names a downstream that is not in `downstreams`.
    pub fn new(
        config: Arc<Config>,
        auth: AuthGate,
        downstreams: HashMap<String, Arc<dyn Downstream>>,
    ) -> Result<Self, ConfigError> {
        let routes = config.effective_routes();
        for (i, route) in routes.iter().enumerate() {
            if !downstreams.contains_key(&route.downstream) {
                return Err(ConfigError::UnknownDownstream {
                    name: route.downstream.clone(),
                    field: format!("routes[{i}].downstream"),
                });
            }
        }

        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(TokenBucketLimiter::new(&config.rate_limit)));

        Ok(Self {
            relay: StreamRelay::new(config.server.stream_max_duration),
            config,
            auth,
            limiter,
            downstreams,
            routes,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.relay = self.relay.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The limiter, if rate limiting is enabled. Exposed for the sweeper.
    pub fn limiter(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.limiter.as_ref()
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    pub fn downstream(&self, name: &str) -> Option<&Arc<dyn Downstream>> {
        self.downstreams.get(name)
    }

    /// Deadline for a request on a route of `kind` arriving now.
    pub fn deadline_for(&self, kind: RouteKind) -> Instant {
        let budget = match kind {
            RouteKind::ChatStream => self.config.server.stream_max_duration,
            RouteKind::Chat | RouteKind::Passthrough => self.config.server.request_timeout,
        };
        Instant::now() + budget
    }

    /// Run the full pipeline for one request.
    #[tracing::instrument(
        skip_all,
        fields(correlation_id = %ctx.correlation_id(), route = %route.path)
    )]
    pub async fn dispatch(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
    ) -> Result<Dispatched, NormalizedError> {
        let result = self.run(route, ctx).await;
        let elapsed_ms = ctx.received_at().elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(dispatched) => {
                if let Some(m) = &self.metrics {
                    m.record_request(&route.path, "success", elapsed_ms);
                }
                Ok(dispatched)
            }
            Err(err) => {
                if err.is_downstream_failure() {
                    warn!(error = %err, "Request failed");
                } else {
                    debug!(error = %err, "Request rejected");
                }
                if let Some(m) = &self.metrics {
                    m.record_request(&route.path, err.error_type_name(), elapsed_ms);
                    if is_rejection(&err) {
                        m.record_rejection(err.error_type_name());
                    }
                }
                Err(NormalizedError::new(&err, ctx.correlation_id()))
            }
        }
    }

    async fn run(&self, route: &RouteConfig, ctx: &RequestContext) -> GatewayResult<Dispatched> {
        let identity = self.authenticate(ctx).await?;
        self.authorize(route, &identity)?;
        let admission = self.rate_limit(route, ctx, identity)?;
        let output = self.invoke(route, ctx, &admission).await?;
        Ok(Dispatched {
            output,
            rate_limit_remaining: admission.remaining,
        })
    }

    // ========================================================================
    // Stages
    // ========================================================================

    async fn authenticate(&self, ctx: &RequestContext) -> GatewayResult<Identity> {
        self.auth.authenticate(ctx.authorization()).await
    }

    fn authorize(&self, route: &RouteConfig, identity: &Identity) -> GatewayResult<()> {
        self.auth.authorize(identity, &route.scopes)
    }

    fn rate_limit(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
        identity: Identity,
    ) -> GatewayResult<Admission> {
        let Some(limiter) = &self.limiter else {
            return Ok(Admission {
                identity,
                remaining: None,
            });
        };

        let key = self.rate_limit_key(route, ctx, &identity);
        match limiter.try_acquire(&key, route.cost) {
            LimitDecision::Admitted { remaining } => Ok(Admission {
                identity,
                remaining: Some(remaining),
            }),
            LimitDecision::Rejected { retry_after } => {
                info!(
                    subject = %identity.subject,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Err(GatewayError::RateLimitExceeded { retry_after })
            }
        }
    }

    async fn invoke(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
        admission: &Admission,
    ) -> GatewayResult<DispatchOutput> {
        if let Some(err) = ctx.payload_error() {
            return Err(err.clone());
        }
        let downstream = self
            .downstreams
            .get(&route.downstream)
            .ok_or_else(|| {
                GatewayError::internal(format!("no client for downstream '{}'", route.downstream))
            })?;

        match route.kind {
            RouteKind::Chat => self.chat(route, ctx, admission, downstream.as_ref()).await,
            RouteKind::ChatStream => {
                self.chat_stream(route, ctx, admission, downstream.as_ref())
                    .await
            }
            RouteKind::Passthrough => self.passthrough(route, ctx, downstream.as_ref()).await,
        }
    }

    // ========================================================================
    // Route kinds
    // ========================================================================

    async fn chat(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
        admission: &Admission,
        downstream: &dyn Downstream,
    ) -> GatewayResult<DispatchOutput> {
        let request = ChatRequest::parse(ctx.payload())?;
        let session_id = request.resolve_session_id();
        let memory = self.enrich(ctx, &admission.identity, &request).await;

        let payload = request.agent_payload(&session_id, memory, false);
        let call = DownstreamRequest::post(route.upstream_path(), payload, ctx.correlation_id())
            .with_idempotent(route.is_idempotent(ctx.method()));

        let response = downstream.call(call, ctx.deadline()).await?;
        let body = chat::shape_reply(downstream.name(), &session_id, &response.body)?;
        Ok(DispatchOutput::Json {
            status: StatusCode::OK,
            body,
        })
    }

    async fn chat_stream(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
        admission: &Admission,
        downstream: &dyn Downstream,
    ) -> GatewayResult<DispatchOutput> {
        let request = ChatRequest::parse(ctx.payload())?;
        let session_id = request.resolve_session_id();
        let memory = self.enrich(ctx, &admission.identity, &request).await;

        let payload = request.agent_payload(&session_id, memory, true);
        // Streams are never retried once opened.
        let call = DownstreamRequest::post(route.upstream_path(), payload, ctx.correlation_id());

        let events = downstream.open_stream(call, ctx.deadline()).await?;
        debug!(session_id = %session_id, "Stream opened");
        Ok(DispatchOutput::Stream(
            self.relay.spawn(events, ctx.correlation_id().to_string()),
        ))
    }

    async fn passthrough(
        &self,
        route: &RouteConfig,
        ctx: &RequestContext,
        downstream: &dyn Downstream,
    ) -> GatewayResult<DispatchOutput> {
        let path = substitute_params(route.upstream_path(), ctx.path_params())?;
        let body = if *ctx.method() == Method::GET || *ctx.method() == Method::HEAD {
            None
        } else {
            parse_json_body(ctx.payload())?
        };

        let call = DownstreamRequest {
            method: ctx.method().clone(),
            path,
            query: ctx.query().map(str::to_string),
            body,
            correlation_id: ctx.correlation_id().to_string(),
            idempotent: route.is_idempotent(ctx.method()),
        };

        let response = downstream.call(call, ctx.deadline()).await?;
        Ok(DispatchOutput::Json {
            status: response.status,
            body: response.body,
        })
    }

    /// Look up memory items for the caller. Never fails the request.
    async fn enrich(
        &self,
        ctx: &RequestContext,
        identity: &Identity,
        request: &ChatRequest,
    ) -> Option<Value> {
        let memory = self.config.memory.as_ref()?;
        if identity.is_anonymous() {
            return None;
        }
        let downstream = self.downstreams.get(&memory.downstream)?;

        let query = json!({
            "user_id": request.user_id,
            "query": request.latest_message(),
            "k": memory.k,
        });
        let call = DownstreamRequest::post(memory.path.as_str(), query, ctx.correlation_id())
            .with_idempotent(true);

        match downstream.call(call, ctx.deadline()).await {
            Ok(response) => chat::memory_results(response.body),
            Err(err) => {
                warn!(
                    downstream = %memory.downstream,
                    error = %err,
                    "Memory enrichment failed, continuing without it"
                );
                None
            }
        }
    }

    fn rate_limit_key(&self, route: &RouteConfig, ctx: &RequestContext, identity: &Identity) -> String {
        let rate_limit = &self.config.rate_limit;
        let base = if identity.is_anonymous() {
            match ctx.client_ip() {
                Some(ip) => format!("anon:{ip}"),
                None => "anon".to_string(),
            }
        } else {
            match rate_limit.key_strategy {
                RateLimitKeyStrategy::Identity => format!("sub:{}", identity.subject),
                RateLimitKeyStrategy::Credential => format!("cred:{}", identity.credential_id),
            }
        };
        match rate_limit.scope {
            RateLimitScope::Global => base,
            RateLimitScope::PerRoute => format!("{base}|{}", route.path),
        }
    }
}

/// Failures raised before any downstream work was done.
fn is_rejection(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Unauthenticated { .. }
            | GatewayError::Forbidden { .. }
            | GatewayError::AuthServiceUnavailable { .. }
            | GatewayError::RateLimitExceeded { .. }
            | GatewayError::ValidationError { .. }
            | GatewayError::DownstreamUnavailable { .. }
    )
}

/// Fill `{name}` segments of `template` from captured path parameters.
fn substitute_params(template: &str, params: &BTreeMap<String, String>) -> GatewayResult<String> {
    let mut path = template.to_string();
    for (name, value) in params {
        if value.is_empty() || value.contains(['/', '?', '#']) || value == ".." {
            return Err(GatewayError::validation(format!(
                "invalid path parameter '{name}'"
            )));
        }
        path = path.replace(&format!("{{{name}}}"), value);
    }
    Ok(path)
}

fn parse_json_body(payload: &[u8]) -> GatewayResult<Option<Value>> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|e| GatewayError::validation(format!("Invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};
    use parking_lot::Mutex;

    use crate::breaker::{BreakerSnapshot, BreakerState};
    use crate::config::{ApiKeyConfig, DownstreamDescriptor, MemoryConfig};
    use crate::downstream::{
        DownstreamHealth, DownstreamResponse, EventStream, HealthStatus, StreamEvent,
    };
    use crate::relay::RelayFrame;

    const KEY: &str = "secret-key-1";

    struct FakeDownstream {
        name: String,
        calls: AtomicUsize,
        reply: GatewayResult<Value>,
        tokens: Vec<&'static str>,
        requests: Mutex<Vec<DownstreamRequest>>,
    }

    impl FakeDownstream {
        fn new(name: &str, reply: GatewayResult<Value>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                reply,
                tokens: vec!["A", "B"],
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> DownstreamRequest {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Downstream for FakeDownstream {
        fn name(&self) -> &str {
            &self.name
        }

        async fn call(
            &self,
            request: DownstreamRequest,
            _deadline: Instant,
        ) -> GatewayResult<DownstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            self.reply.clone().map(|body| DownstreamResponse {
                status: StatusCode::OK,
                body,
            })
        }

        async fn open_stream(
            &self,
            request: DownstreamRequest,
            _deadline: Instant,
        ) -> GatewayResult<EventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            let mut events: Vec<GatewayResult<StreamEvent>> = self
                .tokens
                .iter()
                .map(|t| Ok(StreamEvent::Token(t.to_string())))
                .collect();
            events.push(Ok(StreamEvent::Done));
            Ok(stream::iter(events).boxed())
        }

        async fn health_check(&self) -> DownstreamHealth {
            DownstreamHealth {
                name: self.name.clone(),
                status: HealthStatus::Healthy,
                breaker: BreakerSnapshot {
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                    seconds_since_transition: 0,
                },
                detail: None,
            }
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.auth.api_keys = vec![
            ApiKeyConfig {
                id: "key-1".to_string(),
                key: KEY.to_string(),
                subject: "alice".to_string(),
                scopes: vec!["chat:write".to_string(), "memory:read".to_string()],
            },
            ApiKeyConfig {
                id: "key-2".to_string(),
                key: "reader-key".to_string(),
                subject: "bob".to_string(),
                scopes: vec!["memory:read".to_string()],
            },
        ];
        // Descriptors select the built-in routes; the fakes stand in for them.
        for name in ["agent", "memory"] {
            config
                .downstreams
                .insert(name.to_string(), DownstreamDescriptor::new("http://127.0.0.1:9"));
        }
        config
    }

    struct Harness {
        dispatcher: Dispatcher,
        agent: Arc<FakeDownstream>,
        memory: Arc<FakeDownstream>,
    }

    fn harness(config: Config, agent_reply: GatewayResult<Value>) -> Harness {
        harness_with_memory(config, agent_reply, Ok(json!({"results": [{"text": "likes tea"}]})))
    }

    fn harness_with_memory(
        config: Config,
        agent_reply: GatewayResult<Value>,
        memory_reply: GatewayResult<Value>,
    ) -> Harness {
        let agent = FakeDownstream::new("agent", agent_reply);
        let memory = FakeDownstream::new("memory", memory_reply);
        let mut downstreams: HashMap<String, Arc<dyn Downstream>> = HashMap::new();
        downstreams.insert("agent".to_string(), agent.clone());
        downstreams.insert("memory".to_string(), memory.clone());

        let auth = AuthGate::from_config(&config.auth).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config), auth, downstreams).unwrap();
        Harness {
            dispatcher,
            agent,
            memory,
        }
    }

    fn route<'a>(d: &'a Dispatcher, path: &str) -> &'a RouteConfig {
        d.routes().iter().find(|r| r.path == path).unwrap()
    }

    fn chat_ctx(key: Option<&str>, body: Value) -> RequestContext {
        RequestContext::new(
            "req-1",
            Method::POST,
            "/v1/chat",
            Instant::now() + Duration::from_secs(30),
        )
        .with_authorization(key.map(|k| format!("Bearer {k}")))
        .with_payload(Bytes::from(serde_json::to_vec(&body).unwrap()))
    }

    fn hello() -> Value {
        json!({"messages": [{"role": "user", "content": "Hello"}], "user_id": "u1"})
    }

    fn json_output(d: Dispatched) -> (StatusCode, Value) {
        match d.output {
            DispatchOutput::Json { status, body } => (status, body),
            DispatchOutput::Stream(_) => panic!("expected JSON output"),
        }
    }

    #[tokio::test]
    async fn test_unary_chat_success() {
        let h = harness(config(), Ok(json!({"response": "Hi there"})));
        let route = route(&h.dispatcher, "/v1/chat");

        let out = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap();
        assert_eq!(out.rate_limit_remaining, Some(59));

        let (status, body) = json_output(out);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["role"], "assistant");
        assert_eq!(body["message"]["content"], "Hi there");
        assert!(!body["session_id"].as_str().unwrap().is_empty());
        assert_eq!(h.agent.calls(), 1);

        let sent = h.agent.last_request();
        assert_eq!(sent.path, "/v1/chat");
        assert_eq!(sent.correlation_id, "req-1");
        assert!(!sent.idempotent);
    }

    #[tokio::test]
    async fn test_chat_forwards_conversation_and_session() {
        let mut config = config();
        config.memory = Some(MemoryConfig {
            downstream: "memory".to_string(),
            path: "/search".to_string(),
            k: 5,
        });
        let h = harness(config, Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat");

        let body = json!({
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ],
            "user_id": "u1",
            "session_id": "sess-7",
            "context": {"tz": "UTC"}
        });
        let out = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), body))
            .await
            .unwrap();
        let (_, reply) = json_output(out);
        assert_eq!(reply["session_id"], "sess-7");

        let memory_req = h.memory.last_request();
        assert_eq!(memory_req.path, "/search");
        let query = memory_req.body.unwrap();
        assert_eq!(query["query"], "three");
        assert_eq!(query["k"], 5);

        let payload = h.agent.last_request().body.unwrap();
        assert_eq!(payload["session_id"], "sess-7");
        assert_eq!(payload["message"], "three");
        assert_eq!(payload["messages"][1]["content"], "two");
        assert_eq!(payload["context"]["tz"], "UTC");
        assert_eq!(payload["context"]["memory_context"][0]["text"], "likes tea");
    }

    #[tokio::test]
    async fn test_memory_failure_does_not_fail_chat() {
        let mut config = config();
        config.memory = Some(MemoryConfig {
            downstream: "memory".to_string(),
            path: "/search".to_string(),
            k: 5,
        });
        let h = harness_with_memory(
            config,
            Ok(json!({"response": "ok"})),
            Err(GatewayError::DownstreamUnavailable {
                downstream: "memory".into(),
            }),
        );
        let route = route(&h.dispatcher, "/v1/chat");

        let out = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap();
        assert_eq!(json_output(out).0, StatusCode::OK);
        assert_eq!(h.memory.calls(), 1);

        let payload = h.agent.last_request().body.unwrap();
        assert!(payload["context"].get("memory_context").is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_short_circuits() {
        let h = harness(config(), Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat");

        let err = h
            .dispatcher
            .dispatch(route, &chat_ctx(None, hello()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.envelope.error.trace_id, "req-1");
        assert_eq!(h.agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_makes_no_downstream_call() {
        let h = harness(config(), Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat");

        let err = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some("reader-key"), hello()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "FORBIDDEN");
        assert_eq!(h.agent.calls(), 0);
        assert_eq!(h.memory.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_61st_request_rate_limited() {
        let h = harness(config(), Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat");

        for _ in 0..60 {
            h.dispatcher
                .dispatch(route, &chat_ctx(Some(KEY), hello()))
                .await
                .unwrap();
        }
        let err = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.retry_after_secs.unwrap() > 0);
        assert_eq!(h.agent.calls(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_route_scope_separates_buckets() {
        let mut config = config();
        config.rate_limit.capacity = 1;
        config.rate_limit.scope = RateLimitScope::PerRoute;
        let h = harness(config, Ok(json!({"response": "ok", "results": []})));
        let chat = route(&h.dispatcher, "/v1/chat");
        let search = route(&h.dispatcher, "/v1/memory/search");

        h.dispatcher
            .dispatch(chat, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap();
        let search_ctx = RequestContext::new(
            "req-2",
            Method::POST,
            "/v1/memory/search",
            Instant::now() + Duration::from_secs(30),
        )
        .with_authorization(Some(format!("Bearer {KEY}")))
        .with_payload(Bytes::from_static(br#"{"query":"tea"}"#));
        h.dispatcher.dispatch(search, &search_ctx).await.unwrap();

        let err = h
            .dispatcher
            .dispatch(chat, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_validation_error_before_downstream() {
        let h = harness(config(), Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat");

        let err = h
            .dispatcher
            .dispatch(
                route,
                &chat_ctx(Some(KEY), json!({"messages": [], "user_id": "u1"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(h.agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_payload_raised_after_auth() {
        let h = harness(config(), Ok(json!({"response": "ok"})));
        let route = route(&h.dispatcher, "/v1/chat/stream");
        let ctx = |key: Option<&str>| {
            RequestContext::new(
                "req-5",
                Method::GET,
                "/v1/chat/stream",
                Instant::now() + Duration::from_secs(30),
            )
            .with_authorization(key.map(|k| format!("Bearer {k}")))
            .with_payload_result(Err(GatewayError::validation("Invalid stream query")))
        };

        let err = h.dispatcher.dispatch(route, &ctx(None)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let err = h
            .dispatcher
            .dispatch(route, &ctx(Some("reader-key")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = h.dispatcher.dispatch(route, &ctx(Some(KEY))).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(h.agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_agent_only_config_serves_chat_routes() {
        let mut config = config();
        config.downstreams.remove("memory");
        let agent = FakeDownstream::new("agent", Ok(json!({"response": "ok"})));
        let mut downstreams: HashMap<String, Arc<dyn Downstream>> = HashMap::new();
        downstreams.insert("agent".to_string(), agent.clone());

        let auth = AuthGate::from_config(&config.auth).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(config), auth, downstreams).unwrap();
        let paths: Vec<&str> = dispatcher.routes().iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/v1/chat", "/v1/chat/stream"]);

        let out = dispatcher
            .dispatch(route(&dispatcher, "/v1/chat"), &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap();
        assert_eq!(json_output(out).0, StatusCode::OK);
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_downstream_error_is_normalized() {
        let h = harness(
            config(),
            Err(GatewayError::DownstreamConnection {
                downstream: "agent".into(),
                reason: "connection refused to http://10.0.0.5:9000".into(),
            }),
        );
        let route = route(&h.dispatcher, "/v1/chat");

        let err = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "DOWNSTREAM_UNAVAILABLE");
        assert!(!err.envelope.error.message.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_stream_route_relays_in_order() {
        let h = harness(config(), Ok(json!({})));
        let route = route(&h.dispatcher, "/v1/chat/stream");

        let out = h
            .dispatcher
            .dispatch(route, &chat_ctx(Some(KEY), hello()))
            .await
            .unwrap();
        let DispatchOutput::Stream(session) = out.output else {
            panic!("expected stream");
        };
        let frames: Vec<RelayFrame> = session.collect().await;
        assert_eq!(
            frames,
            vec![
                RelayFrame::Token("A".into()),
                RelayFrame::Token("B".into()),
                RelayFrame::Done,
            ]
        );

        let payload = h.agent.last_request().body.unwrap();
        assert_eq!(payload["stream"], true);
    }

    #[tokio::test]
    async fn test_passthrough_forwards_body_and_params() {
        let mut config = config();
        config.routes = vec![RouteConfig {
            path: "/v1/memory/items/{id}".to_string(),
            methods: vec!["GET".to_string()],
            kind: RouteKind::Passthrough,
            downstream: "memory".to_string(),
            upstream_path: Some("/items/{id}".to_string()),
            scopes: vec!["memory:read".to_string()],
            cost: 1,
            idempotent: None,
        }];
        let h = harness_with_memory(config, Ok(json!({})), Ok(json!({"id": "42"})));
        let route = route(&h.dispatcher, "/v1/memory/items/{id}");

        let ctx = RequestContext::new(
            "req-3",
            Method::GET,
            "/v1/memory/items/42",
            Instant::now() + Duration::from_secs(30),
        )
        .with_authorization(Some("Bearer reader-key".to_string()))
        .with_query(Some("full=true".to_string()))
        .with_path_params(BTreeMap::from([("id".to_string(), "42".to_string())]));

        let (status, body) = json_output(h.dispatcher.dispatch(route, &ctx).await.unwrap());
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "42");

        let sent = h.memory.last_request();
        assert_eq!(sent.method, Method::GET);
        assert_eq!(sent.path, "/items/42");
        assert_eq!(sent.query.as_deref(), Some("full=true"));
        assert!(sent.body.is_none());
        assert!(sent.idempotent);
    }

    #[tokio::test]
    async fn test_passthrough_rejects_invalid_json() {
        let h = harness(config(), Ok(json!({})));
        let route = route(&h.dispatcher, "/v1/memory/search");
        let ctx = RequestContext::new(
            "req-4",
            Method::POST,
            "/v1/memory/search",
            Instant::now() + Duration::from_secs(30),
        )
        .with_authorization(Some(format!("Bearer {KEY}")))
        .with_payload(Bytes::from_static(b"{oops"));

        let err = h.dispatcher.dispatch(route, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(h.memory.calls(), 0);
    }

    #[test]
    fn test_unknown_route_downstream_rejected() {
        let mut config = config();
        config.routes = vec![RouteConfig {
            path: "/v1/x".to_string(),
            methods: vec!["POST".to_string()],
            kind: RouteKind::Passthrough,
            downstream: "nowhere".to_string(),
            upstream_path: None,
            scopes: vec![],
            cost: 1,
            idempotent: None,
        }];
        let auth = AuthGate::from_config(&config.auth).unwrap();
        let result = Dispatcher::new(Arc::new(config), auth, HashMap::new());
        assert!(matches!(
            result,
            Err(ConfigError::UnknownDownstream { ref name, .. }) if name == "nowhere"
        ));
    }

    #[test]
    fn test_substitute_params() {
        let params = BTreeMap::from([("id".to_string(), "abc".to_string())]);
        assert_eq!(
            substitute_params("/items/{id}/tags", &params).unwrap(),
            "/items/abc/tags"
        );

        let bad = BTreeMap::from([("id".to_string(), "a/../b".to_string())]);
        assert!(substitute_params("/items/{id}", &bad).is_err());
    }
}
