//! Intent orchestration.
//!
//! An accepted intent becomes one VNF resource per (target cluster, role)
//! plus a transport rollout. Aggregate progress is derived from the VNF watch
//! stream and the transport verdict; a deployment state machine per intent
//! orders the multi-step flow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mano_core::intent::{role_for_cloud, IntentState, SliceClass, SliceIntent};
use mano_core::slice::SliceTransportSpec;
use mano_core::types::{CloudType, Placement, VnfPhase, VnfResource, VnfSpec, VnfType};
use mano_core::Result;
use mano_lifecycle::deployment::{event, DeploymentMachineBuilder};
use mano_lifecycle::registry::MachineRegistry;
use mano_reconciler::store::VnfStore;
use mano_transport::manager::SliceState;

use crate::transport_client::TransportClient;

/// Shared default UDP port and MTU for slice overlays.
const DEFAULT_TUNNEL_PORT: u32 = 4789;
const DEFAULT_TUNNEL_MTU: u32 = 1450;

#[derive(Debug, Clone, Serialize)]
pub struct IntentReceipt {
    pub intent_id: Uuid,
    pub vnfs: Vec<String>,
    pub state: IntentState,
}

#[derive(Debug, Clone, Serialize)]
pub struct VnfStatusView {
    pub key: String,
    pub phase: Option<VnfPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentStatusView {
    pub intent_id: Uuid,
    pub name: String,
    pub slice_class: SliceClass,
    pub state: IntentState,
    pub machine_state: Option<String>,
    pub vnfs: Vec<VnfStatusView>,
    pub transport_required: bool,
    pub transport: Option<SliceState>,
    pub submitted_at: DateTime<Utc>,
}

struct IntentRecord {
    intent: SliceIntent,
    vnf_keys: Vec<String>,
    transport_required: bool,
    transport_state: Option<SliceState>,
}

#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    pub intents_submitted: AtomicU64,
    pub intents_ready: AtomicU64,
    pub intents_failed: AtomicU64,
    pub vnfs_created: AtomicU64,
}

pub struct Orchestrator {
    namespace: String,
    store: Arc<dyn VnfStore>,
    transport: Arc<dyn TransportClient>,
    machines: Arc<MachineRegistry>,
    intents: Arc<RwLock<HashMap<Uuid, IntentRecord>>>,
    pub metrics: OrchestratorMetrics,
}

impl Orchestrator {
    pub fn new(
        namespace: &str,
        store: Arc<dyn VnfStore>,
        transport: Arc<dyn TransportClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.to_string(),
            store,
            transport,
            machines: Arc::new(MachineRegistry::new()),
            intents: Arc::new(RwLock::new(HashMap::new())),
            metrics: OrchestratorMetrics::default(),
        })
    }

    fn machine_id(intent_id: Uuid) -> String {
        format!("intent-{intent_id}")
    }

    /// Accept an intent: validate, create the member VNFs, kick off the
    /// transport rollout, and start tracking aggregate progress.
    pub async fn submit(self: &Arc<Self>, intent: SliceIntent) -> Result<IntentReceipt> {
        intent.validate()?;
        self.metrics.intents_submitted.fetch_add(1, Ordering::Relaxed);

        let machine = self
            .machines
            .insert(DeploymentMachineBuilder::new(Self::machine_id(intent.intent_id), 3).build());
        let _ = machine.send(event::VALIDATE, json!({})).await;
        let _ = machine.send(event::VALIDATION_SUCCESS, json!({})).await;
        let _ = machine.send(event::PLAN, json!({})).await;

        let qos = intent.qos();
        let mut vnf_keys = Vec::new();
        for cluster in &intent.target_clusters {
            let cloud_type = cloud_type_for(cluster);
            let role = role_for_cloud(cloud_type);
            let name = format!("{}-{}-{}", intent.name, role_slug(role), cluster);
            let vnf = VnfResource::new(
                &self.namespace,
                &name,
                VnfSpec {
                    vnf_type: role,
                    qos,
                    placement: Placement {
                        cloud_type,
                        site: cluster.clone(),
                    },
                    target_clusters: vec![cluster.clone()],
                    version: None,
                },
            );
            let created = self.store.create(vnf).await?;
            self.metrics.vnfs_created.fetch_add(1, Ordering::Relaxed);
            vnf_keys.push(created.key());
        }

        let _ = machine.send(event::PLANNING_SUCCESS, json!({})).await;
        let _ = machine.send(event::DEPLOY, json!({})).await;

        let transport_required = intent.target_clusters.len() >= 2;
        let record = IntentRecord {
            intent: intent.clone(),
            vnf_keys: vnf_keys.clone(),
            transport_required,
            transport_state: None,
        };
        self.intents.write().await.insert(intent.intent_id, record);

        // transport rollout proceeds alongside VNF reconciliation; its
        // verdict is folded into the aggregate when it lands
        if transport_required {
            let orchestrator = self.clone();
            let transport_spec = transport_spec_for(&intent);
            tokio::spawn(async move {
                let state = match orchestrator.transport.rollout(transport_spec).await {
                    Ok(summary) => summary.state,
                    Err(err) => {
                        tracing::error!(
                            intent = %intent.intent_id,
                            error = %err,
                            "transport rollout failed"
                        );
                        SliceState::Failed
                    }
                };
                orchestrator
                    .record_transport_state(intent.intent_id, state)
                    .await;
            });
        }

        Ok(IntentReceipt {
            intent_id: intent.intent_id,
            vnfs: vnf_keys,
            state: IntentState::Pending,
        })
    }

    async fn record_transport_state(&self, intent_id: Uuid, state: SliceState) {
        {
            let mut intents = self.intents.write().await;
            if let Some(record) = intents.get_mut(&intent_id) {
                record.transport_state = Some(state);
            }
        }
        self.evaluate_intent(intent_id).await;
    }

    /// Recompute one intent's aggregate and advance its machine.
    async fn evaluate_intent(&self, intent_id: Uuid) {
        let Some(status) = self.status(intent_id).await else {
            return;
        };
        let Ok(machine) = self.machines.get(&Self::machine_id(intent_id)) else {
            return;
        };

        let all_running = status
            .vnfs
            .iter()
            .all(|v| v.phase == Some(VnfPhase::Running));
        let any_failed = status.vnfs.iter().any(|v| v.phase == Some(VnfPhase::Failed));

        if any_failed && machine.can_fire(event::DEPLOYMENT_FAILURE).await {
            let _ = machine.send(event::DEPLOYMENT_FAILURE, json!({})).await;
            self.metrics.intents_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if all_running && !status.vnfs.is_empty() {
            if machine.can_fire(event::DEPLOYMENT_SUCCESS).await {
                let _ = machine.send(event::DEPLOYMENT_SUCCESS, json!({})).await;
            }
            let transport_ok = !status.transport_required
                || status.transport == Some(SliceState::Applied);
            if transport_ok && machine.can_fire(event::ACTIVATE).await {
                let _ = machine.send(event::ACTIVATE, json!({})).await;
                self.metrics.intents_ready.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Aggregate status for one intent.
    pub async fn status(&self, intent_id: Uuid) -> Option<IntentStatusView> {
        let (intent, vnf_keys, transport_required, transport_state) = {
            let intents = self.intents.read().await;
            let record = intents.get(&intent_id)?;
            (
                record.intent.clone(),
                record.vnf_keys.clone(),
                record.transport_required,
                record.transport_state,
            )
        };

        let mut vnfs = Vec::new();
        for key in &vnf_keys {
            let phase = match key.split_once('/') {
                Some((namespace, name)) => self
                    .store
                    .get(namespace, name)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|v| v.status.phase),
                None => None,
            };
            vnfs.push(VnfStatusView {
                key: key.clone(),
                phase,
            });
        }

        let machine_state = match self.machines.get(&Self::machine_id(intent_id)) {
            Ok(machine) => Some(machine.current_state().await),
            Err(_) => None,
        };

        let state = aggregate_state(&vnfs, transport_required, transport_state);
        Some(IntentStatusView {
            intent_id,
            name: intent.name.clone(),
            slice_class: intent.slice_class,
            state,
            machine_state,
            vnfs,
            transport_required,
            transport: transport_state,
            submitted_at: intent.submitted_at,
        })
    }

    pub async fn list(&self) -> Vec<IntentStatusView> {
        let ids: Vec<Uuid> = self.intents.read().await.keys().copied().collect();
        let mut views = Vec::new();
        for id in ids {
            if let Some(view) = self.status(id).await {
                views.push(view);
            }
        }
        views.sort_by_key(|v| v.submitted_at);
        views
    }

    /// Watch the VNF stream and fold phase changes into intent aggregates.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut watch = self.store.watch();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = watch.recv() => match changed {
                    Ok(_) => {
                        let ids: Vec<Uuid> = self.intents.read().await.keys().copied().collect();
                        for id in ids {
                            self.evaluate_intent(id).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "intent watch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

fn role_slug(role: VnfType) -> &'static str {
    match role {
        VnfType::Ran => "ran",
        VnfType::Cn => "cn",
        VnfType::TnEdge => "tn-edge",
        VnfType::TnCentral => "tn-central",
    }
}

/// Site naming carries the cloud tier by convention.
fn cloud_type_for(cluster: &str) -> CloudType {
    if cluster.starts_with("edge") {
        CloudType::Edge
    } else if cluster.starts_with("reg") {
        CloudType::Regional
    } else {
        CloudType::Central
    }
}

/// The transport portion of an intent.
fn transport_spec_for(intent: &SliceIntent) -> SliceTransportSpec {
    let loss_tolerance = match intent.slice_class {
        SliceClass::Urllc => 0.1,
        SliceClass::Embb => 0.5,
        SliceClass::Mmtc => 1.0,
    };
    SliceTransportSpec {
        slice_id: intent.name.clone(),
        endpoint_nodes: intent.target_clusters.clone(),
        downlink_mbps: intent.throughput_mbps,
        uplink_mbps: intent.throughput_mbps,
        latency_budget_ms: intent.rtt_ms / 2.0,
        jitter_budget_ms: (intent.rtt_ms / 10.0).min(5.0),
        loss_tolerance_percent: loss_tolerance,
        priority: intent.slice_class.priority(),
        node_vnis: HashMap::new(),
        tunnel_port: DEFAULT_TUNNEL_PORT,
        mtu: DEFAULT_TUNNEL_MTU,
        hub_node: None,
    }
}

fn aggregate_state(
    vnfs: &[VnfStatusView],
    transport_required: bool,
    transport: Option<SliceState>,
) -> IntentState {
    if vnfs.iter().any(|v| v.phase == Some(VnfPhase::Failed)) {
        return IntentState::Failed;
    }
    if matches!(transport, Some(SliceState::Failed) | Some(SliceState::RolledBack)) {
        return IntentState::Failed;
    }
    let all_running = !vnfs.is_empty()
        && vnfs
            .iter()
            .all(|v| v.phase == Some(VnfPhase::Running));
    if all_running {
        return match transport {
            None if !transport_required => IntentState::Ready,
            Some(SliceState::Applied) => IntentState::Ready,
            Some(SliceState::Degraded) => IntentState::Degraded,
            _ => IntentState::Deploying,
        };
    }
    if vnfs.iter().all(|v| v.phase.is_none()) {
        IntentState::Pending
    } else {
        IntentState::Deploying
    }
}
