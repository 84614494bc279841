use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Shared route label for requests that matched no registered route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// The registered route template, e.g. `/Patient/:id`. Raw paths carry
/// resource ids, so unmatched requests all share `UNMATCHED_ROUTE`.
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_owned())
}

pub fn record_request(method: &Method, route: String, status: StatusCode, latency_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("route", route),
        ("status", status.as_u16().to_string()),
    ];

    metrics::counter!("ptmerge_http_requests_total", &labels).increment(1);
    metrics::histogram!("ptmerge_http_requests_duration_seconds", &labels).record(latency_secs);
}

/// Request counter and latency histogram, installed by the middleware
/// pipeline when metrics are enabled.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let route = route_label(&req);

    let response = next.run(req).await;

    record_request(
        &method,
        route,
        response.status(),
        start.elapsed().as_secs_f64(),
    );
    response
}
