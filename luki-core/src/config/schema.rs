//! Configuration schema type definitions.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// Constructed once at startup, wrapped in `Arc`, and handed to every
/// component constructor. Nothing mutates it afterwards.
///
/// # Example
/// ```yaml
/// server:
///   bind: 0.0.0.0:8080
///   request_timeout: 120s
///
/// auth:
///   api_keys:
///     - id: web-frontend
///       key: ${LUKI_FRONTEND_KEY}
///       subject: frontend
///       scopes: [chat:write, memory:read]
///
/// rate_limit:
///   requests_per_minute: 60
///
/// downstreams:
///   agent:
///     base_url: http://core-agent:9000
///     required: true
///   memory:
///     base_url: http://memory-service:8002
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backends keyed by name. Routes refer to them by this name.
    #[serde(default)]
    pub downstreams: BTreeMap<String, DownstreamDescriptor>,

    /// Route table. Empty means [`default_routes`], minus any whose
    /// downstream is not configured.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Optional memory enrichment for chat routes.
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
}

impl Config {
    /// Look up a downstream descriptor by name.
    pub fn downstream(&self, name: &str) -> Option<&DownstreamDescriptor> {
        self.downstreams.get(name)
    }

    /// The routes the gateway serves.
    ///
    /// Explicit routes are returned as written, so validation can reject a
    /// bad downstream reference. Built-in routes are only served for the
    /// downstreams that exist: an agent-only deployment gets the chat routes
    /// and nothing else.
    pub fn effective_routes(&self) -> Vec<RouteConfig> {
        if !self.routes.is_empty() {
            return self.routes.clone();
        }
        default_routes()
            .into_iter()
            .filter(|route| self.downstreams.contains_key(&route.downstream))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Public listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for client traffic.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Deadline for unary requests, measured from ingress.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub request_timeout: Duration,

    /// Hard ceiling on a single streaming response.
    #[serde(
        default = "default_stream_max_duration",
        deserialize_with = "duration::deserialize"
    )]
    pub stream_max_duration: Duration,

    /// How often downstream health endpoints are polled.
    #[serde(
        default = "default_health_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub health_interval: Duration,

    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Browser origins allowed to call the gateway. Empty disables CORS;
    /// `"*"` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout: default_request_timeout(),
            stream_max_duration: default_stream_max_duration(),
            health_interval: default_health_interval(),
            max_body_bytes: default_max_body_bytes(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stream_max_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Admin listener settings (`/health`, `/ready`, `/metrics`).
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_bind")]
    pub bind: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
            port: default_admin_port(),
        }
    }
}

fn default_admin_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Credential sources.
///
/// Bearer tokens are checked against the API-key table first, then as JWTs,
/// then (if configured) against the introspection endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,

    #[serde(default)]
    pub jwt: Option<JwtConfig>,

    #[serde(default)]
    pub introspection: Option<IntrospectionConfig>,

    /// Admit requests without an `Authorization` header as the anonymous
    /// identity.
    #[serde(default)]
    pub allow_anonymous: bool,

    /// Scopes granted to the anonymous identity.
    #[serde(default)]
    pub anonymous_scopes: Vec<String>,
}

/// One static API key.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Stable identifier, used as the rate-limit key under the `credential`
    /// strategy and in audit logs. Never the key itself.
    pub id: String,

    /// The secret bearer value.
    pub key: String,

    /// Subject the key authenticates as.
    pub subject: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Signing algorithm accepted for JWT bearer tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum JwtAlgorithm {
    #[default]
    HS256,
    RS256,
}

/// Signed-token verification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub algorithm: JwtAlgorithm,

    /// Shared secret for HS256.
    #[serde(default)]
    pub secret: Option<String>,

    /// PEM-encoded public key for RS256.
    #[serde(default)]
    pub public_key_pem: Option<String>,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,

    /// Claim holding scopes, either a space-separated string or an array.
    #[serde(default = "default_scope_claim")]
    pub scope_claim: String,
}

fn default_scope_claim() -> String {
    "scope".to_string()
}

/// Remote token introspection.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionConfig {
    pub url: String,

    #[serde(
        default = "default_introspection_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub timeout: Duration,
}

fn default_introspection_timeout() -> Duration {
    Duration::from_secs(5)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate Limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the rate-limit bucket is keyed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyStrategy {
    /// The authenticated subject, shared by all of a caller's credentials.
    #[default]
    Identity,
    /// The individual credential (API-key id or token id).
    Credential,
}

/// Whether one bucket covers all routes or each route has its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    #[default]
    Global,
    PerRoute,
}

/// Token-bucket settings.
///
/// `refill_per_second` wins over `requests_per_minute` when both are set.
/// With neither set the bucket refills its full capacity once a minute.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bucket capacity `C` (burst size).
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    #[serde(default)]
    pub refill_per_second: Option<f64>,

    #[serde(default)]
    pub requests_per_minute: Option<u32>,

    #[serde(default)]
    pub key_strategy: RateLimitKeyStrategy,

    #[serde(default)]
    pub scope: RateLimitScope,

    /// Buckets untouched for this long are dropped by the sweeper.
    #[serde(
        default = "default_stale_after",
        deserialize_with = "duration::deserialize"
    )]
    pub stale_after: Duration,
}

impl RateLimitConfig {
    /// Refill rate `R` in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        if let Some(rate) = self.refill_per_second {
            rate
        } else if let Some(rpm) = self.requests_per_minute {
            f64::from(rpm) / 60.0
        } else {
            f64::from(self.capacity) / 60.0
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_capacity(),
            refill_per_second: None,
            requests_per_minute: None,
            key_strategy: RateLimitKeyStrategy::default(),
            scope: RateLimitScope::default(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_capacity() -> u32 {
    60
}

fn default_stale_after() -> Duration {
    Duration::from_secs(600)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Downstreams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Static description of one backend service.
///
/// # Example
/// ```yaml
/// agent:
///   base_url: http://core-agent:9000
///   timeout: 120s
///   max_retries: 2
///   failure_threshold: 5
///   cooldown: 60s
///   max_connections: 20
///   max_idle: 10
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamDescriptor {
    pub base_url: String,

    /// Per-attempt timeout. The request deadline still caps it.
    #[serde(
        default = "default_downstream_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub timeout: Duration,

    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub connect_timeout: Duration,

    /// Retries after the first attempt, idempotent requests only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles on every retry.
    #[serde(
        default = "default_backoff_base",
        deserialize_with = "duration::deserialize"
    )]
    pub backoff_base: Duration,

    /// Consecutive failures that open the breaker (`F`).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before letting a probe through (`D`).
    #[serde(
        default = "default_cooldown",
        deserialize_with = "duration::deserialize"
    )]
    pub cooldown: Duration,

    /// Hard ceiling on concurrent outbound requests.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle keep-alive connections retained per host.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Requests allowed to wait for a connection slot before new ones are
    /// rejected as saturated.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Readiness fails while this downstream is unhealthy.
    #[serde(default)]
    pub required: bool,
}

impl DownstreamDescriptor {
    /// Descriptor with defaults for everything except the URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: default_downstream_timeout(),
            connect_timeout: default_connect_timeout(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            max_connections: default_max_connections(),
            max_idle: default_max_idle(),
            max_queue: default_max_queue(),
            health_path: default_health_path(),
            required: false,
        }
    }

    /// Join the base URL with a path, tolerating slashes on either side.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn default_downstream_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connections() -> usize {
    20
}

fn default_max_idle() -> usize {
    10
}

fn default_max_queue() -> usize {
    64
}

fn default_health_path() -> String {
    "/health".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a route is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Unary chat: validated, enriched, answered as one JSON body.
    Chat,
    /// Streaming chat: same body, answered as server-sent events.
    ChatStream,
    /// Generic JSON forwarding.
    Passthrough,
}

/// One entry of the route table.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Inbound path. `{name}` segments are captured and substituted into
    /// `upstream_path`.
    pub path: String,

    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    pub kind: RouteKind,

    pub downstream: String,

    /// Downstream path. Defaults per kind: `/v1/chat`, `/v1/chat/stream`,
    /// or the inbound path for passthrough.
    #[serde(default)]
    pub upstream_path: Option<String>,

    /// Scopes the identity must hold, all of them.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Tokens debited per request.
    #[serde(default = "default_cost")]
    pub cost: u32,

    /// Whether failed attempts may be retried. Defaults to true for GET
    /// and false otherwise.
    #[serde(default)]
    pub idempotent: Option<bool>,
}

impl RouteConfig {
    /// Downstream path for this route.
    pub fn upstream_path(&self) -> &str {
        match (&self.upstream_path, self.kind) {
            (Some(path), _) => path,
            (None, RouteKind::Chat) => "/v1/chat",
            (None, RouteKind::ChatStream) => "/v1/chat/stream",
            (None, RouteKind::Passthrough) => &self.path,
        }
    }

    /// Whether a request with `method` on this route may be retried.
    pub fn is_idempotent(&self, method: &http::Method) -> bool {
        self.idempotent
            .unwrap_or(method == http::Method::GET || method == http::Method::HEAD)
    }
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

fn default_cost() -> u32 {
    1
}

/// Built-in route table used when the config lists none.
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            path: "/v1/chat".to_string(),
            methods: vec!["POST".to_string()],
            kind: RouteKind::Chat,
            downstream: "agent".to_string(),
            upstream_path: None,
            scopes: vec!["chat:write".to_string()],
            cost: 1,
            idempotent: None,
        },
        RouteConfig {
            path: "/v1/chat/stream".to_string(),
            methods: vec!["POST".to_string(), "GET".to_string()],
            kind: RouteKind::ChatStream,
            downstream: "agent".to_string(),
            upstream_path: None,
            scopes: vec!["chat:write".to_string()],
            cost: 1,
            idempotent: Some(false),
        },
        memory_route("/v1/memory/search", &["POST"], "/search", "memory:read", Some(true)),
        // Life-record items. `{id}` is the user on GET and the item on
        // PUT and DELETE; one name keeps the paths from conflicting.
        memory_route("/v1/elr/items/{id}", &["GET"], "/elr/users/{id}/items", "memory:read", None),
        memory_route("/v1/elr/items", &["POST"], "/elr/items", "memory:write", Some(false)),
        memory_route(
            "/v1/elr/items/{id}",
            &["PUT", "DELETE"],
            "/elr/items/{id}",
            "memory:write",
            Some(true),
        ),
        memory_route("/v1/elr/search", &["POST"], "/elr/search", "memory:read", Some(true)),
    ]
}

fn memory_route(
    path: &str,
    methods: &[&str],
    upstream_path: &str,
    scope: &str,
    idempotent: Option<bool>,
) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        methods: methods.iter().map(|m| (*m).to_string()).collect(),
        kind: RouteKind::Passthrough,
        downstream: "memory".to_string(),
        upstream_path: Some(upstream_path.to_string()),
        scopes: vec![scope.to_string()],
        cost: 1,
        idempotent,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory Enrichment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Memory lookup attached to chat requests before they reach the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_downstream")]
    pub downstream: String,

    #[serde(default = "default_memory_path")]
    pub path: String,

    /// Number of memory items requested.
    #[serde(default = "default_memory_k")]
    pub k: u32,
}

fn default_memory_downstream() -> String {
    "memory".to_string()
}

fn default_memory_path() -> String {
    "/search".to_string()
}

fn default_memory_k() -> u32 {
    5
}
