//! HTTP API for health checks, Prometheus metrics and the live summary

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use eksapi_lib::{
    health::{ComponentStatus, HealthRegistry},
    loadgen::{Journal, RequestSummary, RunSummary},
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub registry: Registry,
    pub journal: Journal,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, registry: Registry, journal: Journal) -> Self {
        Self {
            health_registry,
            registry,
            journal,
        }
    }
}

/// 200 unless a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Latency summary of everything journaled so far
async fn summary(State(state): State<Arc<AppState>>) -> Json<RunSummary> {
    Json(RunSummary {
        writes: RequestSummary::from_records(&state.journal.writes()),
        reads: RequestSummary::from_records(&state.journal.reads()),
    })
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/summary", get(summary))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use eksapi_lib::health::components;
    use eksapi_lib::loadgen::{LoadMetrics, RequestKind, RequestRecord, RequestStatus};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup_test_app() -> (Router, Arc<AppState>, LoadMetrics) {
        let health_registry = HealthRegistry::new();
        health_registry.register(components::TARGET).await;
        health_registry.register(components::WRITERS).await;

        let registry = Registry::new();
        let metrics = LoadMetrics::new(&registry).unwrap();
        let state = Arc::new(AppState::new(health_registry, registry, Journal::new()));
        (create_router(state.clone()), state, metrics)
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn record(kind: RequestKind, took_ms: u64, ok: bool) -> RequestRecord {
        let status = if ok {
            RequestStatus::Ok
        } else {
            RequestStatus::Error("timeout".into())
        };
        RequestRecord::timed(kind, Utc::now(), Duration::from_millis(took_ms), status)
    }

    #[tokio::test]
    async fn test_healthz_ok_when_degraded() {
        let (app, state, _) = setup_test_app().await;
        state
            .health_registry
            .set_degraded(components::WRITERS, "conflicts")
            .await;

        let (status, body) = fetch(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "degraded");
    }

    #[tokio::test]
    async fn test_healthz_unavailable_when_target_unhealthy() {
        let (app, state, _) = setup_test_app().await;
        state
            .health_registry
            .set_unhealthy(components::TARGET, "connection refused")
            .await;

        let (status, body) = fetch(app, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            health["components"]["target"]["message"],
            "connection refused"
        );
    }

    #[tokio::test]
    async fn test_readyz_tracks_run_state() {
        let (app, state, _) = setup_test_app().await;
        let (status, _) = fetch(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.health_registry.mark_running().await;
        let (status, body) = fetch(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(readiness["ready"], true);

        state.health_registry.mark_draining().await;
        let (status, _) = fetch(app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_expose_load_collectors() {
        let (app, _, metrics) = setup_test_app().await;
        metrics.observe(&record(RequestKind::Write, 3, true));
        metrics.observe(&record(RequestKind::List, 5, false));

        let (status, body) = fetch(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("stresser_client_write_requests_success_total 1"));
        assert!(text.contains("stresser_client_read_requests_failure_total 1"));
        assert!(text.contains("stresser_client_write_request_latency_milliseconds_bucket"));
    }

    #[tokio::test]
    async fn test_summary_reflects_journal() {
        let (app, state, _) = setup_test_app().await;
        for took in [1, 2, 3, 4] {
            state.journal.append(record(RequestKind::Write, took, true));
        }
        state.journal.append(record(RequestKind::Read, 10, false));

        let (status, body) = fetch(app, "/summary").await;
        assert_eq!(status, StatusCode::OK);
        let summary: RunSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary.writes.count, 4);
        assert_eq!(summary.writes.failure, 0);
        assert_eq!(summary.writes.max_ms, 4.0);
        assert_eq!(summary.reads.count, 1);
        assert_eq!(summary.reads.failure, 1);
    }
}
