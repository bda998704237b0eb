//! Per-request context and pipeline stage results.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use http::Method;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::GatewayError;

/// Longest inbound `X-Request-ID` accepted as a correlation id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Use the caller's request id if it is printable ASCII and short enough,
/// otherwise generate one.
pub fn correlation_id_from(header: Option<&str>) -> String {
    match header {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id.bytes().all(|b| b.is_ascii_graphic()) =>
        {
            id.to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}

/// Everything known about a request at ingress.
///
/// Built once by the HTTP layer and only ever borrowed by the pipeline.
/// Stage results live in [`Admission`], never in here.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: String,
    method: Method,
    path: String,
    authorization: Option<String>,
    client_ip: Option<IpAddr>,
    query: Option<String>,
    path_params: BTreeMap<String, String>,
    payload: Bytes,
    payload_error: Option<GatewayError>,
    received_at: Instant,
    deadline: Instant,
}

impl RequestContext {
    pub fn new(
        correlation_id: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        deadline: Instant,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            method,
            path: path.into(),
            authorization: None,
            client_ip: None,
            query: None,
            path_params: BTreeMap::new(),
            payload: Bytes::new(),
            payload_error: None,
            received_at: Instant::now(),
            deadline,
        }
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn with_client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_path_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a body that may have failed to read. The failure is held
    /// until the invoke stage, so it never outranks an auth or rate-limit
    /// rejection.
    pub fn with_payload_result(self, payload: Result<Bytes, GatewayError>) -> Self {
        match payload {
            Ok(payload) => self.with_payload(payload),
            Err(err) => Self {
                payload_error: Some(err),
                ..self
            },
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw `Authorization` header value.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    /// Original request body, unmodified.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_error(&self) -> Option<&GatewayError> {
        self.payload_error.as_ref()
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Point after which no downstream attempt may start.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Outcome of the auth and rate-limit stages for an admitted request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: Identity,
    /// Tokens left in the caller's bucket, if limiting is enabled.
    pub remaining: Option<u32>,
}
