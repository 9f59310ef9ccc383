//! Prometheus metrics for the gateway: HTTP traffic, decisions, caches,
//! and sync runs.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

pub struct Metrics {
    pub registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub decisions_total: IntCounterVec,
    pub evaluator_duration_seconds: HistogramVec,
    pub cache_operations_total: IntCounterVec,
    pub sync_runs_total: IntCounterVec,
}

pub static METRICS: Lazy<Metrics> = Lazy::new(|| {
    let registry = Registry::new();

    let http_requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "HTTP requests processed"),
        &["method", "path", "status"],
    )
    .unwrap();
    let http_request_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ),
        &["method", "path"],
    )
    .unwrap();
    let decisions_total = IntCounterVec::new(
        Opts::new("authz_decisions_total", "Authorization decisions by outcome"),
        &["decision", "resource_type", "action"],
    )
    .unwrap();
    let evaluator_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "authz_evaluator_duration_seconds",
            "External rule-evaluation latency in seconds",
        ),
        &["outcome"],
    )
    .unwrap();
    let cache_operations_total = IntCounterVec::new(
        Opts::new("authz_cache_operations_total", "Cache operations by outcome"),
        &["cache", "operation", "outcome"],
    )
    .unwrap();
    let sync_runs_total = IntCounterVec::new(
        Opts::new("authz_sync_runs_total", "Policy sync attempts by outcome"),
        &["outcome"],
    )
    .unwrap();

    registry
        .register(Box::new(http_requests_total.clone()))
        .unwrap();
    registry
        .register(Box::new(http_request_duration_seconds.clone()))
        .unwrap();
    registry.register(Box::new(decisions_total.clone())).unwrap();
    registry
        .register(Box::new(evaluator_duration_seconds.clone()))
        .unwrap();
    registry
        .register(Box::new(cache_operations_total.clone()))
        .unwrap();
    registry.register(Box::new(sync_runs_total.clone())).unwrap();

    Metrics {
        registry,
        http_requests_total,
        http_request_duration_seconds,
        decisions_total,
        evaluator_duration_seconds,
        cache_operations_total,
        sync_runs_total,
    }
});

pub fn record_decision(decision: &str, resource_type: &str, action: &str) {
    METRICS
        .decisions_total
        .with_label_values(&[decision, resource_type, action])
        .inc();
}

pub fn record_sync(outcome: &str) {
    METRICS.sync_runs_total.with_label_values(&[outcome]).inc();
}

/// Per-route traffic accounting. Proxied traffic has no matched route and is
/// labeled `proxy` to keep cardinality bounded.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "proxy".to_string(), |p| p.as_str().to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    METRICS
        .http_requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();
    METRICS
        .http_request_duration_seconds
        .with_label_values(&[&method, &path])
        .observe(start.elapsed().as_secs_f64());
    response
}

/// `/metrics` exposition endpoint.
pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let families = METRICS.registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %err, "Metrics encoding failed");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding failed",
        )
            .into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
