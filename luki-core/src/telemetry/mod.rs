//! Observability for the gateway.
//!
//! ## Module Organization
//!
//! - `metrics` - Prometheus metrics registered on a caller-owned registry

pub mod metrics;

pub use metrics::GatewayMetrics;
