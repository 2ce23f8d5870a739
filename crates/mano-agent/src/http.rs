//! Agent HTTP surface for the transport-network manager.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use mano_core::metrics::{PrometheusText, PROMETHEUS_CONTENT_TYPE};
use mano_core::slice::AgentConfig;
use mano_exec::probe::{ProbeResult, Prober};
use mano_exec::vxlan::TunnelStatus;

use crate::bandwidth::BandwidthSample;
use crate::reconcile::{AgentState, PushedConfigs};

#[derive(Clone)]
pub struct HttpState {
    pub node: String,
    pub state: Arc<AgentState>,
    pub pushed: Arc<PushedConfigs>,
    pub kick: Arc<Notify>,
    pub prober: Arc<Prober>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node: String,
    pub applied_slices: Vec<String>,
    pub tunnels: Vec<TunnelStatus>,
    pub bandwidth: Vec<BandwidthSample>,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub peer: IpAddr,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_duration")]
    pub duration_secs: u32,
}

fn default_probe_port() -> u16 {
    5201
}

fn default_probe_duration() -> u32 {
    5
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TestResponse {
    Ok(ProbeResult),
    Failed { error: String },
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/apply", post(apply))
        .route("/status", get(status))
        .route("/test", post(test_peer))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn apply(
    State(http): State<HttpState>,
    Json(config): Json<AgentConfig>,
) -> impl IntoResponse {
    if let Err(err) = config.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": err.to_string() })),
        );
    }
    let slice_id = config.slice_id.clone();
    http.pushed.upsert(config);
    http.kick.notify_one();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": slice_id })),
    )
}

async fn status(State(http): State<HttpState>) -> impl IntoResponse {
    let tunnels = http.state.tunnels.lock().expect("tunnel lock poisoned").clone();
    let bandwidth = http
        .state
        .bandwidth
        .lock()
        .expect("bandwidth lock poisoned")
        .clone();
    Json(StatusResponse {
        node: http.node.clone(),
        applied_slices: http.state.applied_slices(),
        tunnels,
        bandwidth,
    })
}

async fn test_peer(
    State(http): State<HttpState>,
    Json(request): Json<TestRequest>,
) -> impl IntoResponse {
    match http
        .prober
        .probe(request.peer, request.port, request.duration_secs)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(TestResponse::Ok(result))),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(TestResponse::Failed {
                error: err.to_string(),
            }),
        ),
    }
}

async fn metrics_endpoint(State(http): State<HttpState>) -> impl IntoResponse {
    let mut page = PrometheusText::new();
    page.counter(
        "mano_agent_reconcile_total",
        "Reconcile passes executed",
        http.state.reconcile_total.load(Ordering::Relaxed),
    )
    .counter(
        "mano_agent_reconcile_errors_total",
        "Reconcile passes or slices that failed",
        http.state.reconcile_errors.load(Ordering::Relaxed),
    )
    .gauge(
        "mano_agent_applied_slices",
        "Slices currently materialized on this node",
        http.state.applied_slices().len() as f64,
    );

    let samples: Vec<(Vec<(String, String)>, f64)> = {
        let bandwidth = http
            .state
            .bandwidth
            .lock()
            .expect("bandwidth lock poisoned");
        bandwidth
            .iter()
            .rev()
            .take(8)
            .flat_map(|s| {
                [
                    (
                        vec![
                            ("interface".to_string(), s.interface.clone()),
                            ("direction".to_string(), "rx".to_string()),
                        ],
                        s.rx_bps,
                    ),
                    (
                        vec![
                            ("interface".to_string(), s.interface.clone()),
                            ("direction".to_string(), "tx".to_string()),
                        ],
                        s.tx_bps,
                    ),
                ]
            })
            .collect()
    };
    page.labeled_gauge(
        "mano_agent_bandwidth_bps",
        "Most recent measured interface bandwidth",
        &samples,
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        page.finish(),
    )
}
