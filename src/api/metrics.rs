//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! This module provides:
//! - A `/metrics` endpoint that returns Prometheus-formatted metrics
//! - Middleware for tracking HTTP request counts and durations
//! - Helper functions for Graph dispatch, queue and intelligence metrics

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

// Metric names as constants for consistency
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const GRAPH_CALLS_TOTAL: &str = "graph_api_calls_total";
pub const GRAPH_RATE_LIMITED_TOTAL: &str = "graph_api_rate_limited_total";
pub const REQUESTS_QUEUED_TOTAL: &str = "requests_queued_total";
pub const QUEUE_PENDING: &str = "queue_pending_requests";
pub const BACKFILL_DAYS_TOTAL: &str = "backfill_days_total";
pub const AUTOMATION_EVENTS_TOTAL: &str = "automation_events_total";

/// Initialize the Prometheus metrics recorder and return a handle for rendering metrics.
///
/// This should be called once during application startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(GRAPH_CALLS_TOTAL, "Graph API calls by credential kind");
    describe_counter!(
        GRAPH_RATE_LIMITED_TOTAL,
        "Graph API calls rejected for rate limiting, by credential kind"
    );
    describe_counter!(REQUESTS_QUEUED_TOTAL, "Requests deferred to the retry queue");
    describe_gauge!(QUEUE_PENDING, "Requests currently waiting in the retry queue");
    describe_counter!(BACKFILL_DAYS_TOTAL, "Account-days processed by backfill jobs");
    describe_counter!(AUTOMATION_EVENTS_TOTAL, "Automation rule firings by outcome");

    Ok(handle)
}

/// GET /metrics - Returns Prometheus-formatted metrics.
///
/// This endpoint is accessible without authentication.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queued_requests WHERE status = 'queued'")
            .fetch_one(&state.db)
            .await
    {
        gauge!(QUEUE_PENDING).set(count as f64);
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Use the matched route template so ids do not explode label cardinality
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_graph_call(credential: &'static str) {
    counter!(GRAPH_CALLS_TOTAL, "credential" => credential).increment(1);
}

pub fn record_rate_limited(credential: &'static str) {
    counter!(GRAPH_RATE_LIMITED_TOTAL, "credential" => credential).increment(1);
}

pub fn record_request_queued() {
    counter!(REQUESTS_QUEUED_TOTAL).increment(1);
}

pub fn record_backfill_day() {
    counter!(BACKFILL_DAYS_TOTAL).increment(1);
}

pub fn record_automation_event(outcome: &'static str) {
    counter!(AUTOMATION_EVENTS_TOTAL, "outcome" => outcome).increment(1);
}
