//! Orchestrator HTTP surface.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use mano_core::intent::SliceIntent;
use mano_core::metrics::{PrometheusText, PROMETHEUS_CONTENT_TYPE};
use mano_core::ManoError;

use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/intents", post(submit_intent).get(list_intents))
        .route("/intents/:id/status", get(intent_status))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_intent(
    State(state): State<HttpState>,
    Json(intent): Json<SliceIntent>,
) -> impl IntoResponse {
    match state.orchestrator.submit(intent).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(serde_json::json!(receipt))).into_response(),
        Err(err @ ManoError::Validation(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn list_intents(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.orchestrator.list().await)
}

async fn intent_status(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.orchestrator.status(id).await {
        Some(view) => Json(serde_json::json!(view)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("intent {id} not found") })),
        )
            .into_response(),
    }
}

async fn metrics_endpoint(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics = &state.orchestrator.metrics;
    let mut page = PrometheusText::new();
    page.counter(
        "mano_orchestrator_intents_total",
        "Intents submitted",
        metrics.intents_submitted.load(Ordering::Relaxed),
    )
    .counter(
        "mano_orchestrator_intents_ready_total",
        "Intents that reached Ready",
        metrics.intents_ready.load(Ordering::Relaxed),
    )
    .counter(
        "mano_orchestrator_intents_failed_total",
        "Intents that failed",
        metrics.intents_failed.load(Ordering::Relaxed),
    )
    .counter(
        "mano_orchestrator_vnfs_created_total",
        "VNF resources created from intents",
        metrics.vnfs_created.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        page.finish(),
    )
}
