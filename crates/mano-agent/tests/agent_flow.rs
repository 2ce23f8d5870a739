//! Agent surface scenarios: hostile configuration rejection and the
//! out-of-band apply path feeding the reconcile loop.

use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt;

use mano_agent::http::{router, HttpState};
use mano_agent::reconcile::{AgentReconciler, AgentState, CompositeSource, PushedConfigs};
use mano_core::slice::OVERLAY_INTERFACE;
use mano_exec::command::RecordingRunner;
use mano_exec::probe::Prober;

fn slice_config_json(slice_id: &str, vni: u32, interface: &str) -> serde_json::Value {
    serde_json::json!({
        "slice_id": slice_id,
        "vni": vni,
        "tc_rules": [{
            "interface": interface,
            "direction": "egress",
            "rate_kbit": 4000,
            "burst_kb": 32,
            "latency_ms": 8.0,
            "priority": 1,
            "class_id": "1:10",
            "parent": "1:",
            "handle": "100:",
            "commands": []
        }],
        "tunnels": [{
            "device": format!("vxlan{vni}"),
            "vni": vni,
            "local_ip": "10.0.1.1",
            "remote_ips": ["10.0.1.2"],
            "mtu": 1450,
            "udp_port": 4789,
            "learning": false,
            "commands": []
        }],
        "priority": 1
    })
}

struct Surface {
    app: axum::Router,
    runner: Arc<RecordingRunner>,
    reconciler: AgentReconciler,
    state: Arc<AgentState>,
}

fn surface() -> Surface {
    let runner = Arc::new(RecordingRunner::new());
    let state = AgentState::new();
    let pushed = PushedConfigs::new();
    let kick = Arc::new(Notify::new());

    let reconciler = AgentReconciler::new(
        "node01".to_string(),
        Arc::new(CompositeSource::new(None, pushed.clone())),
        runner.clone(),
        state.clone(),
        kick.clone(),
    );

    let app = router(HttpState {
        node: "node01".to_string(),
        state: state.clone(),
        pushed,
        kick,
        prober: Arc::new(Prober::new(runner.clone())),
    });

    Surface {
        app,
        runner,
        reconciler,
        state,
    }
}

async fn post_apply(app: axum::Router, body: serde_json::Value) -> axum::http::StatusCode {
    let response = app
        .oneshot(
            axum::http::Request::post("/apply")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn hostile_interface_never_reaches_a_process() {
    let s = surface();

    let status = post_apply(
        s.app.clone(),
        slice_config_json("bad-slice", 151, "eth0$(cat /etc/passwd)"),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::UNPROCESSABLE_ENTITY);

    // the good slice is unaffected by the rejected one
    let status = post_apply(
        s.app.clone(),
        slice_config_json("good-slice", 150, OVERLAY_INTERFACE),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::ACCEPTED);

    s.reconciler.reconcile_once().await.unwrap();

    assert_eq!(s.state.applied_slices(), vec!["good-slice".to_string()]);
    for (_, args) in s.runner.calls() {
        for arg in args {
            assert!(
                !arg.contains('$') && !arg.contains(';'),
                "hostile argument spawned: {arg}"
            );
        }
    }
}

#[tokio::test]
async fn out_of_band_apply_lands_in_kernel_state_and_status() {
    let s = surface();

    let status = post_apply(
        s.app.clone(),
        slice_config_json("embb-1", 150, OVERLAY_INTERFACE),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::ACCEPTED);

    s.reconciler.reconcile_once().await.unwrap();

    let lines = s.runner.command_lines();
    assert!(lines.iter().any(|l| l.contains("link add vxlan150")));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("tc qdisc add dev vxlan150 root")));

    let response = s
        .app
        .clone()
        .oneshot(
            axum::http::Request::get("/status")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["applied_slices"][0], "embb-1");
}
