//! Client-facing HTTP surface.
//!
//! The router is built from the configured route table: each
//! `(method, path)` pair gets the same handler with its [`RouteConfig`]
//! attached as an extension. Everything else answers with a normalized
//! `NOT_FOUND`.
//!
//! Every response carries `X-Request-ID`, either the caller's (when it is
//! usable) or a generated one. Browser callers are admitted by a CORS layer
//! when `server.allowed_origins` is set.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{
        ConnectInfo, DefaultBodyLimit, Path, Query, Request, State,
        rejection::{BytesRejection, ExtensionRejection, PathRejection},
    },
    handler::Handler,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
};
use bytes::Bytes;
use luki_core::auth::AuthGate;
use luki_core::config::{Config, RouteConfig, RouteKind};
use luki_core::dispatcher::{DispatchOutput, Dispatcher, RequestContext, correlation_id_from};
use luki_core::downstream::{Downstream, DownstreamClient, REQUEST_ID_HEADER};
use luki_core::lifecycle::LifecycleManager;
use luki_core::telemetry::GatewayMetrics;
use luki_core::GatewayError;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{ApiError, StartupError};
use crate::sse::sse_response;

/// Remaining tokens in the caller's bucket after an admitted request.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Correlation id of the current request, set by the request-id middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// State shared by all client-facing handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<LifecycleManager>,
}

impl GatewayState {
    /// Build clients, the auth gate and the dispatcher from `config`.
    ///
    /// Each downstream is registered with `lifecycle` for readiness.
    pub fn from_config(
        config: Arc<Config>,
        lifecycle: Arc<LifecycleManager>,
        metrics: Option<Arc<GatewayMetrics>>,
    ) -> Result<Self, StartupError> {
        let auth = AuthGate::from_config(&config.auth)?;
        let downstreams = build_downstreams(&config, metrics.as_ref())?;
        for (name, descriptor) in &config.downstreams {
            lifecycle.register_downstream(name, descriptor.required);
        }

        let mut dispatcher = Dispatcher::new(config, auth, downstreams)?;
        if let Some(metrics) = metrics {
            dispatcher = dispatcher.with_metrics(metrics);
        }

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            lifecycle,
        })
    }

    /// All downstreams, for the health monitor.
    pub fn downstreams(&self) -> Vec<Arc<dyn Downstream>> {
        self.dispatcher
            .config()
            .downstreams
            .keys()
            .filter_map(|name| self.dispatcher.downstream(name).cloned())
            .collect()
    }
}

/// One pooled client per configured downstream.
pub fn build_downstreams(
    config: &Config,
    metrics: Option<&Arc<GatewayMetrics>>,
) -> Result<HashMap<String, Arc<dyn Downstream>>, StartupError> {
    let mut clients: HashMap<String, Arc<dyn Downstream>> = HashMap::new();
    for (name, descriptor) in &config.downstreams {
        let mut client = DownstreamClient::new(name.clone(), descriptor.clone()).map_err(
            |source| StartupError::Downstream {
                name: name.clone(),
                source,
            },
        )?;
        if let Some(metrics) = metrics {
            client = client.with_metrics(Arc::clone(metrics));
        }
        info!(
            downstream = %name,
            base_url = %descriptor.base_url,
            max_connections = descriptor.max_connections,
            max_retries = descriptor.max_retries,
            "Downstream client ready"
        );
        clients.insert(name.clone(), Arc::new(client));
    }
    Ok(clients)
}

/// Build the client-facing router.
pub fn router(state: GatewayState) -> Router {
    let max_body_bytes = state.dispatcher.config().server.max_body_bytes;

    let mut by_path: BTreeMap<String, MethodRouter<GatewayState>> = BTreeMap::new();
    for route in state.dispatcher.routes() {
        let route = Arc::new(route.clone());
        for method in &route.methods {
            let Some(filter) = method_filter(method) else {
                continue;
            };
            let handler = route_handler.layer(Extension(Arc::clone(&route)));
            let entry = by_path
                .remove(&route.path)
                .unwrap_or_else(|| MethodRouter::new().fallback(not_found));
            by_path.insert(route.path.clone(), entry.on(filter, handler));
        }
    }

    let mut router = Router::new();
    for (path, methods) in by_path {
        router = router.route(&path, methods);
    }

    let router = router
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn(request_id));
    let router = match cors_layer(&state.dispatcher.config().server.allowed_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// CORS for the configured origins, or `None` when the list is empty.
///
/// Credentials travel in the `Authorization` header, so cookies are never
/// allowed and `*` stays a valid origin.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([
                HeaderName::from_static(REQUEST_ID_HEADER),
                HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
                header::RETRY_AFTER,
            ]),
    )
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        "HEAD" => Some(MethodFilter::HEAD),
        _ => None,
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Resolve the correlation id and echo it on the response.
async fn request_id(mut request: Request, next: Next) -> Response {
    let id = correlation_id_from(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

// ============================================================================
// Handlers
// ============================================================================

/// Query parameters accepted by `GET` on a streaming route.
#[derive(Debug, Deserialize)]
struct StreamQuery {
    message: String,
    user_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn route_handler(
    State(state): State<GatewayState>,
    Extension(route): Extension<Arc<RouteConfig>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    params: Result<Path<BTreeMap<String, String>>, PathRejection>,
    connect: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let Some(guard) = state.lifecycle.track_request() else {
        return ApiError::from_gateway(&GatewayError::ShuttingDown, &request_id).into_response();
    };

    // Non-UTF-8 header values still count as a credential, just a malformed one.
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default().to_string());

    let payload = request_payload(&route, &method, &uri, body);
    let ctx = RequestContext::new(
        request_id,
        method,
        uri.path(),
        state.dispatcher.deadline_for(route.kind),
    )
    .with_authorization(authorization)
    .with_client_ip(connect.ok().map(|ConnectInfo(addr)| addr.ip()))
    .with_query(uri.query().map(str::to_string))
    .with_path_params(params.map(|Path(p)| p).unwrap_or_default())
    .with_payload_result(payload);

    let dispatched = match state.dispatcher.dispatch(&route, &ctx).await {
        Ok(dispatched) => dispatched,
        Err(err) => return ApiError(err).into_response(),
    };

    let mut response = match dispatched.output {
        DispatchOutput::Json { status, body } => (status, Json(body)).into_response(),
        DispatchOutput::Stream(session) => sse_response(session, Some(guard)),
    };
    if let Some(remaining) = dispatched.rate_limit_remaining {
        response.headers_mut().insert(
            HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
            HeaderValue::from(remaining),
        );
    }
    response
}

/// Body bytes handed to the dispatcher.
///
/// `GET` on a streaming route carries the chat request in the query string;
/// it is rebuilt into the same JSON body a `POST` would send. Errors are
/// raised by the dispatcher once the caller is authenticated.
fn request_payload(
    route: &RouteConfig,
    method: &Method,
    uri: &Uri,
    body: Result<Bytes, BytesRejection>,
) -> Result<Bytes, GatewayError> {
    if route.kind == RouteKind::ChatStream && *method == Method::GET {
        let Query(query) = Query::<StreamQuery>::try_from_uri(uri).map_err(|e| {
            GatewayError::ValidationError {
                details: format!("Invalid stream query: {}", e.body_text()),
            }
        })?;
        let body = json!({
            "messages": [{ "role": "user", "content": query.message }],
            "user_id": query.user_id,
            "session_id": query.session_id,
        });
        return Ok(Bytes::from(body.to_string()));
    }

    body.map_err(|e| GatewayError::ValidationError {
        details: format!("Unreadable request body: {}", e.body_text()),
    })
}

async fn not_found(
    method: Method,
    uri: Uri,
    request_id: Result<Extension<RequestId>, ExtensionRejection>,
) -> Response {
    let trace_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_default();
    let err = GatewayError::NotFound {
        method: method.to_string(),
        path: uri.path().to_string(),
    };
    ApiError::from_gateway(&err, &trace_id).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use luki_core::config::{ApiKeyConfig, DownstreamDescriptor};
    use luki_core::lifecycle::LifecycleConfig;
    use tower::ServiceExt;

    fn state() -> GatewayState {
        state_with(|_| {})
    }

    fn state_with(adjust: impl FnOnce(&mut Config)) -> GatewayState {
        let mut config = Config::default();
        config.auth.api_keys = vec![ApiKeyConfig {
            id: "k1".into(),
            key: "secret".into(),
            subject: "alice".into(),
            scopes: vec!["chat:write".into()],
        }];
        // Never contacted by these tests.
        for name in ["agent", "memory"] {
            config.downstreams.insert(
                name.to_string(),
                DownstreamDescriptor::new("http://127.0.0.1:9"),
            );
        }
        adjust(&mut config);
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        GatewayState::from_config(Arc::new(config), lifecycle, None).unwrap()
    }

    async fn send(router: Router, request: axum::http::Request<Body>) -> (Response, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (Response::from_parts(parts, Body::empty()), json)
    }

    #[tokio::test]
    async fn test_unknown_path_is_normalized_404() {
        let request = axum::http::Request::builder()
            .uri("/v2/nothing")
            .header(REQUEST_ID_HEADER, "trace-404")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state()), request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-404");
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["trace_id"], "trace-404");
    }

    #[tokio::test]
    async fn test_wrong_method_is_not_found() {
        let request = axum::http::Request::builder()
            .method("DELETE")
            .uri("/v1/chat")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state()), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_request_id_generated_when_missing() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state()), request).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert_eq!(json["error"]["trace_id"], id);
    }

    #[tokio::test]
    async fn test_malformed_stream_query_without_credentials_is_401() {
        let request = axum::http::Request::builder()
            .uri("/v1/chat/stream?user_id=u1")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state()), request).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_malformed_stream_query_with_credentials_is_400() {
        let request = axum::http::Request::builder()
            .uri("/v1/chat/stream?user_id=u1")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state()), request).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    fn preflight(origin: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/v1/chat")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization,content-type")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cors_allows_listed_origin_only() {
        let state = state_with(|config| {
            config.server.allowed_origins = vec!["https://app.luki.ai".to_string()];
        });
        let app = router(state);

        let (response, _) = send(app.clone(), preflight("https://app.luki.ai")).await;
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.luki.ai"
        );

        let (response, _) = send(app, preflight("https://evil.example")).await;
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_cors_off_without_origins() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header(header::ORIGIN, "https://app.luki.ai")
            .body(Body::empty())
            .unwrap();
        let (response, _) = send(router(state()), request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_shutting_down_rejects_new_requests() {
        let state = state();
        state.lifecycle.begin_shutdown();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (response, json) = send(router(state), request).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_stream_query_rebuilt_as_body() {
        let route = RouteConfig {
            path: "/v1/chat/stream".into(),
            methods: vec!["GET".into()],
            kind: RouteKind::ChatStream,
            downstream: "agent".into(),
            upstream_path: None,
            scopes: vec![],
            cost: 1,
            idempotent: None,
        };
        let uri: Uri = "/v1/chat/stream?message=hi%20there&user_id=u1".parse().unwrap();
        let payload = request_payload(&route, &Method::GET, &uri, Ok(Bytes::new())).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["messages"][0]["content"], "hi there");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["user_id"], "u1");

        let bad: Uri = "/v1/chat/stream?user_id=u1".parse().unwrap();
        assert!(request_payload(&route, &Method::GET, &bad, Ok(Bytes::new())).is_err());
    }
}
