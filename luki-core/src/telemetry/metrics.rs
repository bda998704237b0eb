//! Prometheus metrics using the prometheus-client crate.
//!
//! [`GatewayMetrics`] registers every gateway metric into a caller-owned
//! `Registry`; the admin server encodes that registry on `/metrics` in
//! OpenMetrics text format.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::breaker::BreakerState;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels for inbound request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Route path as configured (not the concrete URL)
    pub route: String,
    /// "success" or a snake_case error type
    pub outcome: String,
}

/// Labels for rejection counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    /// Error type name of the rejection
    pub reason: String,
}

/// Labels for per-route histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

/// Labels for downstream attempt counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DownstreamLabels {
    pub downstream: String,
    /// HTTP status code, or "timeout" / "connect_error" / "rejected"
    pub outcome: String,
}

/// Labels keyed only by downstream name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DownstreamNameLabels {
    pub downstream: String,
}

/// Labels for stream duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StreamLabels {
    /// "completed", "client_disconnected", "downstream_failed" or "timed_out"
    pub outcome: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Histogram Buckets
// ─────────────────────────────────────────────────────────────────────────────

/// Request duration buckets in milliseconds.
const REQUEST_DURATION_BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

/// Downstream attempt duration buckets in milliseconds.
const DOWNSTREAM_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0,
];

/// Stream duration buckets in milliseconds (streams run up to minutes).
const STREAM_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 15000.0, 30000.0, 60000.0, 120000.0, 300000.0,
];

/// All gateway metrics.
pub struct GatewayMetrics {
    // ─────────────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────────────
    pub requests_total: Family<RequestLabels, Counter>,
    pub rejections_total: Family<RejectionLabels, Counter>,
    pub downstream_requests_total: Family<DownstreamLabels, Counter>,
    pub downstream_retries_total: Family<DownstreamNameLabels, Counter>,

    // ─────────────────────────────────────────────────────────────────────
    // Histograms
    // ─────────────────────────────────────────────────────────────────────
    pub request_duration_ms: Family<RouteLabels, Histogram>,
    pub downstream_duration_ms: Family<DownstreamNameLabels, Histogram>,
    pub stream_duration_ms: Family<StreamLabels, Histogram>,

    // ─────────────────────────────────────────────────────────────────────
    // Gauges
    // ─────────────────────────────────────────────────────────────────────
    pub breaker_state: Family<DownstreamNameLabels, Gauge>,
    pub streams_active: Gauge,
    pub uptime_seconds: Gauge,
}

impl GatewayMetrics {
    /// Create and register all metrics.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "luki_requests",
            "Inbound requests by route and outcome",
            requests_total.clone(),
        );

        let rejections_total = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "luki_rejections",
            "Requests rejected before or during dispatch, by reason",
            rejections_total.clone(),
        );

        let downstream_requests_total = Family::<DownstreamLabels, Counter>::default();
        registry.register(
            "luki_downstream_requests",
            "Downstream call attempts by outcome",
            downstream_requests_total.clone(),
        );

        let downstream_retries_total = Family::<DownstreamNameLabels, Counter>::default();
        registry.register(
            "luki_downstream_retries",
            "Downstream retry attempts",
            downstream_retries_total.clone(),
        );

        let request_duration_ms =
            Family::<RouteLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "luki_request_duration_ms",
            "End-to-end unary request latency in milliseconds",
            request_duration_ms.clone(),
        );

        let downstream_duration_ms =
            Family::<DownstreamNameLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DOWNSTREAM_BUCKETS.iter().copied())
            });
        registry.register(
            "luki_downstream_duration_ms",
            "Downstream attempt latency in milliseconds",
            downstream_duration_ms.clone(),
        );

        let stream_duration_ms = Family::<StreamLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(STREAM_BUCKETS.iter().copied())
        });
        registry.register(
            "luki_stream_duration_ms",
            "Streaming response duration in milliseconds by outcome",
            stream_duration_ms.clone(),
        );

        let breaker_state = Family::<DownstreamNameLabels, Gauge>::default();
        registry.register(
            "luki_breaker_state",
            "Circuit breaker state per downstream (0 closed, 1 half-open, 2 open)",
            breaker_state.clone(),
        );

        let streams_active = Gauge::default();
        registry.register(
            "luki_streams_active",
            "Streams currently being relayed",
            streams_active.clone(),
        );

        let uptime_seconds = Gauge::default();
        registry.register(
            "luki_uptime_seconds",
            "Seconds since process start",
            uptime_seconds.clone(),
        );

        Self {
            requests_total,
            rejections_total,
            downstream_requests_total,
            downstream_retries_total,
            request_duration_ms,
            downstream_duration_ms,
            stream_duration_ms,
            breaker_state,
            streams_active,
            uptime_seconds,
        }
    }

    pub fn record_request(&self, route: &str, outcome: &str, duration_ms: f64) {
        self.requests_total
            .get_or_create(&RequestLabels {
                route: route.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.request_duration_ms
            .get_or_create(&RouteLabels {
                route: route.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total
            .get_or_create(&RejectionLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_downstream_attempt(&self, downstream: &str, outcome: &str, duration_ms: f64) {
        self.downstream_requests_total
            .get_or_create(&DownstreamLabels {
                downstream: downstream.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.downstream_duration_ms
            .get_or_create(&DownstreamNameLabels {
                downstream: downstream.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_retry(&self, downstream: &str) {
        self.downstream_retries_total
            .get_or_create(&DownstreamNameLabels {
                downstream: downstream.to_string(),
            })
            .inc();
    }

    pub fn set_breaker_state(&self, downstream: &str, state: BreakerState) {
        self.breaker_state
            .get_or_create(&DownstreamNameLabels {
                downstream: downstream.to_string(),
            })
            .set(state.as_gauge());
    }

    pub fn record_stream(&self, outcome: &str, duration_ms: f64) {
        self.stream_duration_ms
            .get_or_create(&StreamLabels {
                outcome: outcome.to_string(),
            })
            .observe(duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let mut registry = Registry::default();
        let metrics = GatewayMetrics::new(&mut registry);

        metrics.record_request("/v1/chat", "success", 42.5);
        metrics.record_rejection("rate_limited");
        metrics.record_downstream_attempt("agent", "200", 12.0);
        metrics.record_retry("agent");
        metrics.set_breaker_state("agent", BreakerState::Open);
        metrics.record_stream("completed", 1500.0);
        metrics.streams_active.inc();

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .expect("encoding should succeed");

        assert!(buffer.contains("luki_requests_total"));
        assert!(buffer.contains("luki_rejections_total"));
        assert!(!buffer.contains("_total_total"));
        assert!(buffer.contains(r#"reason="rate_limited""#));
        assert!(buffer.contains(r#"luki_breaker_state{downstream="agent"} 2"#));
        assert!(buffer.contains("luki_stream_duration_ms"));
        assert!(buffer.contains("luki_streams_active 1"));
    }
}
