use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
];

/// Readiness flag flipped by `main` once the consumers run, and back before shutdown
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub async fn index() -> &'static str {
    "kafka archiver"
}

async fn readiness(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Health routes for the service. The prometheus endpoint is added by `setup_metrics_routes`.
pub fn health_router(state: Readiness) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")))
        .with_state(state)
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route("/metrics", get(move || ready(recorder_handle.render())))
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install prometheus recorder")
}

/// Records request counts and latencies per matched route
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Bind a `TcpListener` on `bind` and serve `router` until the task is aborted
pub async fn serve(router: Router, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind metrics server to {bind}"))?;

    axum::serve(listener, router)
        .await
        .context("Metrics server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_flag() {
        let readiness = Readiness::default();
        assert!(!readiness.is_ready());

        let shared = readiness.clone();
        shared.set(true);
        assert!(readiness.is_ready());

        shared.set(false);
        assert!(!readiness.is_ready());
    }

    #[tokio::test]
    async fn test_readiness_status_follows_flag() {
        let flag = Readiness::default();

        let response = readiness(State(flag.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        flag.set(true);
        let response = readiness(State(flag)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
