//! Slice rollout across node agents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use tokio_util::sync::CancellationToken;

use mano_core::slice::{AgentConfig, SliceTransportSpec};
use mano_core::{ManoError, Result};

use crate::planner::{plan_slice, NodeInfo, VniAllocator};

/// Throughput must reach 80 % of target, RTT must stay within 120 %.
pub const THROUGHPUT_COMPLIANCE_FACTOR: f64 = 0.8;
pub const RTT_COMPLIANCE_FACTOR: f64 = 1.2;

/// How long to wait for an agent to report a slice applied.
const APPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const APPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusView {
    pub applied_slices: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub throughput_mbps: f64,
    pub rtt_ms: f64,
    pub loss_percent: f64,
}

/// Transport-manager view of one node agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn apply(&self, node: &NodeInfo, config: &AgentConfig) -> Result<()>;
    async fn status(&self, node: &NodeInfo) -> Result<AgentStatusView>;
    async fn probe(
        &self,
        node: &NodeInfo,
        peer: IpAddr,
        port: u16,
        duration_secs: u32,
    ) -> Result<ProbeOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceState {
    Planning,
    Applying,
    Applied,
    Degraded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub slice_id: String,
    pub measured_throughput_mbps: f64,
    pub target_throughput_mbps: f64,
    pub measured_rtt_ms: f64,
    pub target_rtt_ms: f64,
    pub loss_percent: f64,
    pub compliant: bool,
    pub probed_at: DateTime<Utc>,
}

#[derive(Clone)]
struct SliceRecord {
    spec: SliceTransportSpec,
    vni: u32,
    plans: HashMap<String, AgentConfig>,
    /// Content each agent held before this rollout, for reverse rollback.
    previous: HashMap<String, Option<AgentConfig>>,
    state: SliceState,
    report: Option<ComplianceReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceSummary {
    pub slice_id: String,
    pub vni: u32,
    pub state: SliceState,
    pub nodes: Vec<String>,
    pub report: Option<ComplianceReport>,
}

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub slices_planned: AtomicU64,
    pub slices_applied: AtomicU64,
    pub slices_failed: AtomicU64,
    pub rollbacks: AtomicU64,
    pub probes_run: AtomicU64,
}

pub struct TransportManager {
    nodes: HashMap<String, NodeInfo>,
    agents: Arc<dyn AgentClient>,
    allocator: VniAllocator,
    slices: RwLock<HashMap<String, SliceRecord>>,
    pub metrics: ManagerMetrics,
    probe_enabled: bool,
    probe_port: u16,
    probe_duration_secs: u32,
}

impl TransportManager {
    pub fn new(
        nodes: HashMap<String, NodeInfo>,
        agents: Arc<dyn AgentClient>,
        vni_start: u32,
    ) -> Self {
        Self {
            nodes,
            agents,
            allocator: VniAllocator::new(vni_start),
            slices: RwLock::new(HashMap::new()),
            metrics: ManagerMetrics::default(),
            probe_enabled: true,
            probe_port: 5201,
            probe_duration_secs: 5,
        }
    }

    pub fn with_probing(mut self, enabled: bool) -> Self {
        self.probe_enabled = enabled;
        self
    }

    /// Deploy or update a slice: plan, fan out, wait for agents, probe, and
    /// record the verdict. Any failure past the first apply walks the agents
    /// back in reverse order.
    pub async fn rollout(&self, spec: SliceTransportSpec) -> Result<SliceSummary> {
        spec.validate()?;
        let vni = self.allocator.assign(&spec.slice_id)?;
        let plans = plan_slice(&spec, vni, &self.nodes)?;
        self.metrics.slices_planned.fetch_add(1, Ordering::Relaxed);

        // remember what each agent held before we touch it
        let previous: HashMap<String, Option<AgentConfig>> = {
            let slices = self.slices.read().await;
            plans
                .keys()
                .map(|node| {
                    let prior = slices
                        .get(&spec.slice_id)
                        .and_then(|r| r.plans.get(node).cloned());
                    (node.clone(), prior)
                })
                .collect()
        };

        let mut record = SliceRecord {
            spec: spec.clone(),
            vni,
            plans: plans.clone(),
            previous,
            state: SliceState::Applying,
            report: None,
        };

        let mut node_order: Vec<String> = plans.keys().cloned().collect();
        node_order.sort();

        let mut applied: Vec<String> = Vec::new();
        for node_name in &node_order {
            let node = &self.nodes[node_name];
            match self.agents.apply(node, &plans[node_name]).await {
                Ok(()) => applied.push(node_name.clone()),
                Err(err) => {
                    tracing::error!(slice = %spec.slice_id, node = %node_name, error = %err, "apply failed; rolling back");
                    self.rollback(&record, &applied).await;
                    record.state = SliceState::RolledBack;
                    self.metrics.slices_failed.fetch_add(1, Ordering::Relaxed);
                    self.store_record(record).await;
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.wait_applied(&spec.slice_id, &node_order).await {
            tracing::error!(slice = %spec.slice_id, error = %err, "agents did not converge; rolling back");
            self.rollback(&record, &applied).await;
            record.state = SliceState::RolledBack;
            self.metrics.slices_failed.fetch_add(1, Ordering::Relaxed);
            self.store_record(record).await;
            return Err(err);
        }

        if self.probe_enabled {
            match self.probe_pair(&spec, &node_order).await {
                Ok(report) => {
                    record.state = if report.compliant {
                        SliceState::Applied
                    } else {
                        SliceState::Degraded
                    };
                    record.report = Some(report);
                }
                Err(err) => {
                    tracing::error!(slice = %spec.slice_id, error = %err, "compliance probe failed; rolling back");
                    self.rollback(&record, &applied).await;
                    record.state = SliceState::RolledBack;
                    self.metrics.slices_failed.fetch_add(1, Ordering::Relaxed);
                    self.store_record(record).await;
                    return Err(err);
                }
            }
        } else {
            record.state = SliceState::Applied;
        }

        self.metrics.slices_applied.fetch_add(1, Ordering::Relaxed);
        let summary = summarize(&record);
        self.store_record(record).await;
        Ok(summary)
    }

    /// Tear a slice down: neutral configs to every agent, VNI released.
    pub async fn teardown(&self, slice_id: &str) -> Result<()> {
        let record = {
            let mut slices = self.slices.write().await;
            slices.remove(slice_id)
        }
        .ok_or_else(|| ManoError::not_found("slice", slice_id))?;

        let mut node_order: Vec<String> = record.plans.keys().cloned().collect();
        node_order.sort();
        for node_name in node_order.iter().rev() {
            let node = &self.nodes[node_name];
            let neutral = AgentConfig {
                slice_id: slice_id.to_string(),
                vni: record.vni,
                tc_rules: Vec::new(),
                tunnels: Vec::new(),
                priority: 1,
            };
            if let Err(err) = self.agents.apply(node, &neutral).await {
                tracing::warn!(slice = %slice_id, node = %node_name, error = %err, "teardown apply failed");
            }
        }
        self.allocator.release(slice_id);
        Ok(())
    }

    pub async fn summaries(&self) -> Vec<SliceSummary> {
        let slices = self.slices.read().await;
        let mut summaries: Vec<SliceSummary> = slices.values().map(summarize).collect();
        summaries.sort_by(|a, b| a.slice_id.cmp(&b.slice_id));
        summaries
    }

    pub async fn report(&self, slice_id: &str) -> Result<SliceSummary> {
        let slices = self.slices.read().await;
        slices
            .get(slice_id)
            .map(summarize)
            .ok_or_else(|| ManoError::not_found("slice", slice_id))
    }

    /// Re-probe every applied or degraded slice and refresh its verdict.
    /// Keeps the per-slice reports current between rollouts.
    pub async fn reprobe_all(&self) {
        let candidates: Vec<(String, SliceTransportSpec, Vec<String>)> = {
            let slices = self.slices.read().await;
            slices
                .values()
                .filter(|r| matches!(r.state, SliceState::Applied | SliceState::Degraded))
                .map(|r| {
                    let mut nodes: Vec<String> = r.plans.keys().cloned().collect();
                    nodes.sort();
                    (r.spec.slice_id.clone(), r.spec.clone(), nodes)
                })
                .collect()
        };

        for (slice_id, spec, node_order) in candidates {
            if node_order.len() < 2 {
                continue;
            }
            match self.probe_pair(&spec, &node_order).await {
                Ok(report) => {
                    let mut slices = self.slices.write().await;
                    if let Some(record) = slices.get_mut(&slice_id) {
                        record.state = if report.compliant {
                            SliceState::Applied
                        } else {
                            SliceState::Degraded
                        };
                        record.report = Some(report);
                    }
                }
                Err(err) => {
                    tracing::warn!(slice = %slice_id, error = %err, "periodic probe failed");
                }
            }
        }
    }

    /// Ticker-driven probe loop; wakes on the interval or on cancellation.
    pub async fn run_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so rollouts settle first
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.reprobe_all().await,
            }
        }
    }

    async fn store_record(&self, record: SliceRecord) {
        let mut slices = self.slices.write().await;
        slices.insert(record.spec.slice_id.clone(), record);
    }

    /// Restore the prior content on every touched agent, in reverse apply
    /// order. Nodes that had no prior content get a neutral configuration.
    async fn rollback(&self, record: &SliceRecord, applied: &[String]) {
        self.metrics.rollbacks.fetch_add(1, Ordering::Relaxed);
        for node_name in applied.iter().rev() {
            let node = &self.nodes[node_name];
            let restore = record
                .previous
                .get(node_name)
                .cloned()
                .flatten()
                .unwrap_or_else(|| AgentConfig {
                    slice_id: record.spec.slice_id.clone(),
                    vni: record.vni,
                    tc_rules: Vec::new(),
                    tunnels: Vec::new(),
                    priority: 1,
                });
            if let Err(err) = self.agents.apply(node, &restore).await {
                tracing::warn!(node = %node_name, error = %err, "rollback apply failed");
            }
        }
    }

    /// Poll each agent's status until the slice shows up or the bounded wait
    /// expires.
    async fn wait_applied(&self, slice_id: &str, node_order: &[String]) -> Result<()> {
        for node_name in node_order {
            let node = &self.nodes[node_name];
            let deadline = tokio::time::Instant::now() + APPLY_WAIT_TIMEOUT;
            loop {
                match self.agents.status(node).await {
                    Ok(status) if status.applied_slices.iter().any(|s| s == slice_id) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(node = %node_name, error = %err, "status poll failed");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ManoError::Timeout {
                        timeout_ms: APPLY_WAIT_TIMEOUT.as_millis() as u64,
                    });
                }
                tokio::time::sleep(APPLY_POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Synthetic probe across a representative pair: the first node measures
    /// against the second node's data address.
    async fn probe_pair(
        &self,
        spec: &SliceTransportSpec,
        node_order: &[String],
    ) -> Result<ComplianceReport> {
        self.metrics.probes_run.fetch_add(1, Ordering::Relaxed);
        let source = &self.nodes[&node_order[0]];
        let target = &self.nodes[&node_order[1]];

        let outcome = self
            .agents
            .probe(
                source,
                target.data_ip,
                self.probe_port,
                self.probe_duration_secs,
            )
            .await?;

        let target_throughput = spec.downlink_mbps;
        let target_rtt = spec.latency_budget_ms * 2.0;
        let compliant = outcome.throughput_mbps
            >= target_throughput * THROUGHPUT_COMPLIANCE_FACTOR
            && outcome.rtt_ms <= target_rtt * RTT_COMPLIANCE_FACTOR;

        Ok(ComplianceReport {
            slice_id: spec.slice_id.clone(),
            measured_throughput_mbps: outcome.throughput_mbps,
            target_throughput_mbps: target_throughput,
            measured_rtt_ms: outcome.rtt_ms,
            target_rtt_ms: target_rtt,
            loss_percent: outcome.loss_percent,
            compliant,
            probed_at: Utc::now(),
        })
    }
}

fn summarize(record: &SliceRecord) -> SliceSummary {
    let mut nodes: Vec<String> = record.plans.keys().cloned().collect();
    nodes.sort();
    SliceSummary {
        slice_id: record.spec.slice_id.clone(),
        vni: record.vni,
        state: record.state,
        nodes,
        report: record.report.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mano_core::slice::SlicePriority;
    use std::sync::Mutex;

    fn nodes() -> HashMap<String, NodeInfo> {
        [("edge01", "10.0.1.1"), ("edge02", "10.0.1.2")]
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

    fn spec() -> SliceTransportSpec {
        SliceTransportSpec {
            slice_id: "embb-1".to_string(),
            endpoint_nodes: vec!["edge01".to_string(), "edge02".to_string()],
            downlink_mbps: 4.57,
            uplink_mbps: 4.57,
            latency_budget_ms: 8.05,
            jitter_budget_ms: 1.0,
            loss_tolerance_percent: 0.5,
            priority: SlicePriority::Medium,
            node_vnis: HashMap::new(),
            tunnel_port: 4789,
            mtu: 1450,
            hub_node: None,
        }
    }

    /// Scriptable agent double tracking apply order.
    struct FakeAgents {
        applies: Mutex<Vec<(String, AgentConfig)>>,
        fail_apply_on: Mutex<Option<String>>,
        probe: Mutex<Option<Result<ProbeOutcome>>>,
    }

    impl FakeAgents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applies: Mutex::new(Vec::new()),
                fail_apply_on: Mutex::new(None),
                probe: Mutex::new(None),
            })
        }

        fn applied_nodes(&self) -> Vec<String> {
            self.applies
                .lock()
                .unwrap()
                .iter()
                .map(|(n, _)| n.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AgentClient for FakeAgents {
        async fn apply(&self, node: &NodeInfo, config: &AgentConfig) -> Result<()> {
            if self.fail_apply_on.lock().unwrap().as_deref() == Some(node.name.as_str()) {
                return Err(ManoError::Transient("agent unreachable".into()));
            }
            self.applies
                .lock()
                .unwrap()
                .push((node.name.clone(), config.clone()));
            Ok(())
        }

        async fn status(&self, _node: &NodeInfo) -> Result<AgentStatusView> {
            let applied = self
                .applies
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.slice_id.clone())
                .collect();
            Ok(AgentStatusView {
                applied_slices: applied,
            })
        }

        async fn probe(
            &self,
            _node: &NodeInfo,
            _peer: IpAddr,
            _port: u16,
            _duration_secs: u32,
        ) -> Result<ProbeOutcome> {
            match self.probe.lock().unwrap().take() {
                Some(outcome) => outcome,
                None => Ok(ProbeOutcome {
                    throughput_mbps: 4.0,
                    rtt_ms: 16.0,
                    loss_percent: 0.0,
                }),
            }
        }
    }

    #[tokio::test]
    async fn successful_rollout_reports_compliance() {
        let agents = FakeAgents::new();
        let manager = TransportManager::new(nodes(), agents.clone(), 100);

        let summary = manager.rollout(spec()).await.unwrap();
        assert_eq!(summary.state, SliceState::Applied);
        let report = summary.report.unwrap();
        assert!(report.compliant);
        // 4.0 >= 4.57 * 0.8 and 16.0 <= 16.1 * 1.2
        assert!(report.measured_throughput_mbps >= report.target_throughput_mbps * 0.8);
        assert_eq!(agents.applied_nodes(), vec!["edge01", "edge02"]);
    }

    #[tokio::test]
    async fn under_target_probe_marks_slice_degraded() {
        let agents = FakeAgents::new();
        *agents.probe.lock().unwrap() = Some(Ok(ProbeOutcome {
            throughput_mbps: 1.0,
            rtt_ms: 50.0,
            loss_percent: 2.0,
        }));
        let manager = TransportManager::new(nodes(), agents, 100);

        let summary = manager.rollout(spec()).await.unwrap();
        assert_eq!(summary.state, SliceState::Degraded);
        assert!(!summary.report.unwrap().compliant);
    }

    #[tokio::test]
    async fn apply_failure_rolls_back_in_reverse_order() {
        let agents = FakeAgents::new();
        *agents.fail_apply_on.lock().unwrap() = Some("edge02".to_string());
        let manager = TransportManager::new(nodes(), agents.clone(), 100);

        let err = manager.rollout(spec()).await.unwrap_err();
        assert!(err.is_retryable());

        // edge01 was applied, then restored with a neutral config
        let applies = agents.applies.lock().unwrap();
        assert_eq!(applies.len(), 2);
        assert_eq!(applies[0].0, "edge01");
        assert_eq!(applies[1].0, "edge01");
        assert!(applies[1].1.tc_rules.is_empty());
        assert!(applies[1].1.tunnels.is_empty());
    }

    #[tokio::test]
    async fn probe_failure_triggers_rollback_and_error() {
        let agents = FakeAgents::new();
        *agents.probe.lock().unwrap() =
            Some(Err(ManoError::Transient("probe path down".into())));
        let manager = TransportManager::new(nodes(), agents.clone(), 100);

        assert!(manager.rollout(spec()).await.is_err());
        let report = manager.report("embb-1").await.unwrap();
        assert_eq!(report.state, SliceState::RolledBack);
    }

    #[tokio::test]
    async fn periodic_reprobe_flips_compliance_both_ways() {
        let agents = FakeAgents::new();
        let manager = TransportManager::new(nodes(), agents.clone(), 100);
        manager.rollout(spec()).await.unwrap();
        assert_eq!(manager.report("embb-1").await.unwrap().state, SliceState::Applied);

        // the path deteriorates
        *agents.probe.lock().unwrap() = Some(Ok(ProbeOutcome {
            throughput_mbps: 0.5,
            rtt_ms: 80.0,
            loss_percent: 5.0,
        }));
        manager.reprobe_all().await;
        assert_eq!(manager.report("embb-1").await.unwrap().state, SliceState::Degraded);

        // and recovers (the fake's default outcome is healthy)
        manager.reprobe_all().await;
        let summary = manager.report("embb-1").await.unwrap();
        assert_eq!(summary.state, SliceState::Applied);
        assert!(summary.report.unwrap().compliant);
    }

    #[tokio::test]
    async fn teardown_releases_the_vni_for_reuse_after_lifetime() {
        let agents = FakeAgents::new();
        let manager = TransportManager::new(nodes(), agents, 100);
        manager.rollout(spec()).await.unwrap();

        let vni_before = manager.allocator.lookup("embb-1").unwrap();
        manager.teardown("embb-1").await.unwrap();
        assert!(manager.allocator.lookup("embb-1").is_none());

        // a new slice never receives the released value while counting up
        let next = manager.allocator.assign("other").unwrap();
        assert!(next > vni_before);
    }
}
