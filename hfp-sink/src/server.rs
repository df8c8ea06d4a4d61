use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::{ActivityTracker, HealthCheck, HealthStatus};
use crate::metrics_consts::{
    HTTP_REQUESTS_COUNTER, HTTP_REQUEST_DURATION_HISTOGRAM, WRITE_CYCLE_RECORDS_HISTOGRAM,
};

/// Durations in seconds, from a health request up to an upload hitting the S3 timeout.
const SECONDS_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Records drained per write cycle, up to a full default queue.
const RECORDS_BUCKETS: &[f64] = &[
    0.0, 10.0, 100.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0, 250_000.0, 750_000.0,
];

#[derive(Clone)]
pub struct AppState {
    pub activity: Arc<ActivityTracker>,
    pub health: HealthCheck,
}

pub async fn index() -> &'static str {
    "hfp sink service"
}

async fn health(State(state): State<AppState>) -> HealthStatus {
    state.health.check(&state.activity)
}

/// Index and health routes. Readiness and liveness share the activity check.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(health))
        .route("/_liveness", get(health))
        .with_state(state)
}

/// Adds `/metrics` and the HTTP metrics middleware; call last.
pub fn with_metrics_routes(router: Router, recorder: PrometheusHandle) -> Router {
    router
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets(SECONDS_BUCKETS)
        .context("Invalid histogram buckets")?
        .set_buckets_for_metric(
            Matcher::Full(WRITE_CYCLE_RECORDS_HISTOGRAM.to_string()),
            RECORDS_BUCKETS,
        )
        .context("Invalid record count buckets")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Counts scrapes and health checks per route. Unmatched paths share one label so
/// scanners cannot grow the label set.
async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());

    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_COUNTER, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_HISTOGRAM, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

pub async fn serve(router: Router, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    axum::serve(listener, router)
        .await
        .context("HTTP server failed")?;
    Ok(())
}
