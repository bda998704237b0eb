//! LUKi gateway core: the transport-agnostic request-dispatch pipeline.
//!
//! This library holds everything between an accepted HTTP request and the
//! bytes written back: credential checks, per-caller rate limiting,
//! breaker-guarded downstream clients, the streaming relay and the single
//! error shape every failure is mapped to. The `luki-gateway` crate binds it
//! to an axum server.
//!
//! Request flow:
//!
//! ```text
//! RequestContext -> AuthGate -> TokenBucketLimiter -> DownstreamClient -> response
//!                                                          |
//!                                                          +-> StreamRelay -> SSE
//! ```

pub mod auth;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod relay;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult, NormalizedError};
