//! Transport-network manager HTTP surface.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use mano_core::metrics::{PrometheusText, PROMETHEUS_CONTENT_TYPE};
use mano_core::slice::SliceTransportSpec;
use mano_core::ManoError;

use crate::manager::TransportManager;

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<TransportManager>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slices", post(create_slice).get(list_slices))
        .route("/slices/:id", delete(delete_slice))
        .route("/slices/:id/report", get(slice_report))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn error_response(err: ManoError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        ManoError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ManoError::Resource { problem, .. } if problem == "not found" => StatusCode::NOT_FOUND,
        ManoError::Timeout { .. } | ManoError::Transient(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_slice(
    State(state): State<HttpState>,
    Json(spec): Json<SliceTransportSpec>,
) -> impl IntoResponse {
    match state.manager.rollout(spec).await {
        Ok(summary) => (StatusCode::CREATED, Json(serde_json::json!(summary))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn list_slices(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.manager.summaries().await)
}

async fn delete_slice(
    State(state): State<HttpState>,
    Path(slice_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.teardown(&slice_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn slice_report(
    State(state): State<HttpState>,
    Path(slice_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.report(&slice_id).await {
        Ok(summary) => Json(serde_json::json!(summary)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn metrics_endpoint(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics = &state.manager.metrics;
    let mut page = PrometheusText::new();
    page.counter(
        "mano_tn_slices_planned_total",
        "Slices planned",
        metrics.slices_planned.load(Ordering::Relaxed),
    )
    .counter(
        "mano_tn_slices_applied_total",
        "Slices applied across all agents",
        metrics.slices_applied.load(Ordering::Relaxed),
    )
    .counter(
        "mano_tn_slices_failed_total",
        "Slice rollouts that failed",
        metrics.slices_failed.load(Ordering::Relaxed),
    )
    .counter(
        "mano_tn_rollbacks_total",
        "Rollback walks executed",
        metrics.rollbacks.load(Ordering::Relaxed),
    )
    .counter(
        "mano_tn_probes_total",
        "Synthetic compliance probes run",
        metrics.probes_run.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        page.finish(),
    )
}
