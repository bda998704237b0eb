//! LUKi gateway HTTP surface.
//!
//! Binds the `luki-core` dispatch pipeline to axum: the client-facing
//! router built from the route table, the SSE response body for streaming
//! routes, and the admin server for probes and metrics.

pub mod admin;
pub mod error;
pub mod server;
pub mod sse;

pub use error::{ApiError, StartupError};
pub use server::{GatewayState, RequestId, router};
