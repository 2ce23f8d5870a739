//! Intent-to-Ready flow across the orchestrator, reconciler and transport
//! manager, with the external repository and deployment service faked.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mano_core::intent::{IntentState, SliceClass, SliceIntent};
use mano_core::slice::AgentConfig;
use mano_core::types::{VnfPhase, VnfType};
use mano_core::Result;
use mano_orchestrator::orchestrator::Orchestrator;
use mano_orchestrator::transport_client::InProcessTransport;
use mano_reconciler::controller::Controller;
use mano_reconciler::metrics::ReconcilerMetrics;
use mano_reconciler::optimized::{OptimizedReconciler, OptimizerConfig};
use mano_reconciler::reconciler::VnfReconciler;
use mano_reconciler::store::{InMemoryVnfStore, VnfStore};
use mano_reconciler::testing::{FakeDeploymentClient, FakePackageBuilder};
use mano_transport::manager::{
    AgentClient, AgentStatusView, ProbeOutcome, TransportManager,
};
use mano_transport::planner::NodeInfo;

/// Agents that apply instantly and measure a healthy slice.
struct InstantAgents {
    applies: Mutex<Vec<(String, AgentConfig)>>,
}

#[async_trait]
impl AgentClient for InstantAgents {
    async fn apply(&self, node: &NodeInfo, config: &AgentConfig) -> Result<()> {
        self.applies
            .lock()
            .unwrap()
            .push((node.name.clone(), config.clone()));
        Ok(())
    }

    async fn status(&self, _node: &NodeInfo) -> Result<AgentStatusView> {
        Ok(AgentStatusView {
            applied_slices: self
                .applies
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.slice_id.clone())
                .collect(),
        })
    }

    async fn probe(
        &self,
        _node: &NodeInfo,
        _peer: IpAddr,
        _port: u16,
        _duration_secs: u32,
    ) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome {
            throughput_mbps: 4.2,
            rtt_ms: 16.0,
            loss_percent: 0.1,
        })
    }
}

fn transport_nodes() -> HashMap<String, NodeInfo> {
    [("edge01", "10.0.1.1"), ("reg01", "10.0.2.1")]
        .into_iter()
        .map(|(name, ip)| {
            (
                name.to_string(),
                NodeInfo {
                    name: name.to_string(),
                    agent_url: format!("http://{name}:8081"),
                    data_ip: ip.parse().unwrap(),
                },
            )
        })
        .collect()
}

#[tokio::test]
async fn embb_intent_reaches_ready_with_compliant_transport() {
    let cancel = CancellationToken::new();

    let store = InMemoryVnfStore::new();
    let packages = Arc::new(FakePackageBuilder::new());
    let deployments = Arc::new(FakeDeploymentClient::new());

    let base = Arc::new(VnfReconciler::new(
        store.clone(),
        packages,
        deployments,
        cancel.clone(),
    ));
    let optimized = Arc::new(OptimizedReconciler::new(
        base,
        store.clone(),
        Arc::new(ReconcilerMetrics::new()),
        OptimizerConfig::default(),
        cancel.clone(),
    ));
    let controller = Controller::new(store.clone(), optimized, 2, cancel.clone());
    let controller_task = tokio::spawn(async move { controller.run().await });

    let agents = Arc::new(InstantAgents {
        applies: Mutex::new(Vec::new()),
    });
    let manager = Arc::new(TransportManager::new(transport_nodes(), agents, 100));
    let transport = Arc::new(InProcessTransport::new(manager.clone()));

    let orchestrator = Orchestrator::new("slices", store.clone(), transport);
    let watcher = orchestrator.clone();
    let watch_cancel = cancel.clone();
    tokio::spawn(async move { watcher.run(watch_cancel).await });

    let intent = SliceIntent {
        intent_id: Uuid::new_v4(),
        name: "embb-demo".to_string(),
        slice_class: SliceClass::Embb,
        throughput_mbps: 4.57,
        rtt_ms: 16.1,
        target_clusters: vec!["edge01".to_string(), "reg01".to_string()],
        site: None,
        submitted_at: chrono::Utc::now(),
    };
    let receipt = orchestrator.submit(intent).await.unwrap();
    assert_eq!(receipt.vnfs.len(), 2);

    // the aggregate converges to Ready without manual intervention
    let mut state = IntentState::Pending;
    for _ in 0..100 {
        if let Some(status) = orchestrator.status(receipt.intent_id).await {
            state = status.state;
            if state == IntentState::Ready {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, IntentState::Ready, "intent never became Ready");

    // both member VNFs run, one radio at the edge and one core regional
    let vnfs = store.list().await.unwrap();
    assert_eq!(vnfs.len(), 2);
    assert!(vnfs
        .iter()
        .all(|v| v.status.phase == Some(VnfPhase::Running)));
    assert!(vnfs.iter().any(|v| v.spec.vnf_type == VnfType::Ran));
    assert!(vnfs.iter().any(|v| v.spec.vnf_type == VnfType::Cn));

    // the transport probe met the compliance envelope:
    // throughput >= 4.57 * 0.8 and rtt <= 16.1 * 1.2
    let report = manager.report("embb-demo").await.unwrap().report.unwrap();
    assert!(report.compliant);
    assert!(report.measured_throughput_mbps >= 3.656);
    assert!(report.measured_rtt_ms <= 19.32);

    cancel.cancel();
    let _ = controller_task.await;
}
