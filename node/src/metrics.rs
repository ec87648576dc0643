//! # Prometheus Metrics
//!
//! Operational metrics for the escrow node, scraped at `/metrics` on the
//! configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Escrow transactions created through the API.
    pub transactions_created_total: IntCounter,
    /// Committed state transitions, labelled by operation.
    pub transitions_total: IntCounterVec,
    /// Disputes opened.
    pub disputes_opened_total: IntCounter,
    /// Operations that failed because the payment gateway did.
    pub gateway_failures_total: IntCounter,
    /// Payouts transferred to sellers.
    pub payouts_completed_total: IntCounter,
    /// API request latency in seconds.
    pub request_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("escrow".into()), None)?;

        let transactions_created_total = IntCounter::new(
            "transactions_created_total",
            "Total number of escrow transactions created",
        )?;
        registry.register(Box::new(transactions_created_total.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "transitions_total",
                "Committed transaction state transitions by operation",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let disputes_opened_total =
            IntCounter::new("disputes_opened_total", "Total number of disputes opened")?;
        registry.register(Box::new(disputes_opened_total.clone()))?;

        let gateway_failures_total = IntCounter::new(
            "gateway_failures_total",
            "Operations rejected because a payment gateway call failed",
        )?;
        registry.register(Box::new(gateway_failures_total.clone()))?;

        let payouts_completed_total = IntCounter::new(
            "payouts_completed_total",
            "Total number of seller payouts transferred",
        )?;
        registry.register(Box::new(payouts_completed_total.clone()))?;

        let request_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "request_latency_seconds",
                "API request handling latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            transactions_created_total,
            transitions_total,
            disputes_opened_total,
            gateway_failures_total,
            payouts_completed_total,
            request_latency_seconds,
        })
    }

    pub fn record_transition(&self, kind: &str) {
        self.transitions_total.with_label_values(&[kind]).inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
