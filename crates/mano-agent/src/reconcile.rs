//! Node-local reconciliation.
//!
//! One task owns all executor state on the node. Every tick it fetches the
//! configuration objects scoped to this node, materializes tunnels first and
//! shaping rules second, and records what is applied for the HTTP handlers.
//! A failing slice never blocks the others.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use mano_core::sanitize::sanitize_for_log;
use mano_core::slice::{AgentConfig, TcRule, OVERLAY_INTERFACE};
use mano_core::Result;
use mano_exec::command::CommandRunner;
use mano_exec::tc::TrafficController;
use mano_exec::vxlan::{TunnelManager, TunnelStatus};

use crate::bandwidth::BandwidthSample;

/// Where a node's slice configuration comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, node: &str) -> Result<Vec<AgentConfig>>;
}

/// Distributed configuration dropped as files under `<dir>/<node>/`.
pub struct FileConfigSource {
    dir: PathBuf,
}

impl FileConfigSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self, node: &str) -> Result<Vec<AgentConfig>> {
        let node_dir = self.dir.join(node);
        let mut configs = Vec::new();
        let entries = match std::fs::read_dir(&node_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(configs), // nothing distributed yet
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)?;
            let parsed: std::result::Result<AgentConfig, String> = match ext {
                "json" => serde_json::from_str(&raw).map_err(|e| e.to_string()),
                "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| e.to_string()),
                _ => continue,
            };
            match parsed {
                Ok(config) => configs.push(config),
                Err(err) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %sanitize_for_log(&err),
                        "skipping unparseable slice configuration"
                    );
                }
            }
        }
        // deterministic apply order
        configs.sort_by(|a, b| a.slice_id.cmp(&b.slice_id));
        Ok(configs)
    }
}

/// Configuration accepted out-of-band through `POST /apply`.
#[derive(Default)]
pub struct PushedConfigs {
    configs: Mutex<HashMap<String, AgentConfig>>,
}

impl PushedConfigs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert(&self, config: AgentConfig) {
        self.configs
            .lock()
            .expect("pushed config lock poisoned")
            .insert(config.slice_id.clone(), config);
    }

    pub fn remove(&self, slice_id: &str) -> bool {
        self.configs
            .lock()
            .expect("pushed config lock poisoned")
            .remove(slice_id)
            .is_some()
    }

    fn all(&self) -> Vec<AgentConfig> {
        self.configs
            .lock()
            .expect("pushed config lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Merge of the distributed source and pushed configs; pushed entries win on
/// slice-id collision.
pub struct CompositeSource {
    file: Option<FileConfigSource>,
    pushed: Arc<PushedConfigs>,
}

impl CompositeSource {
    pub fn new(file: Option<FileConfigSource>, pushed: Arc<PushedConfigs>) -> Self {
        Self { file, pushed }
    }
}

#[async_trait]
impl ConfigSource for CompositeSource {
    async fn fetch(&self, node: &str) -> Result<Vec<AgentConfig>> {
        let mut merged: HashMap<String, AgentConfig> = HashMap::new();
        if let Some(file) = &self.file {
            for config in file.fetch(node).await? {
                merged.insert(config.slice_id.clone(), config);
            }
        }
        for config in self.pushed.all() {
            merged.insert(config.slice_id.clone(), config);
        }
        let mut configs: Vec<AgentConfig> = merged.into_values().collect();
        configs.sort_by(|a, b| a.slice_id.cmp(&b.slice_id));
        Ok(configs)
    }
}

/// Snapshot shared between the reconcile task and the HTTP handlers.
#[derive(Default)]
pub struct AgentState {
    pub applied: Mutex<HashMap<String, AgentConfig>>,
    pub tunnels: Mutex<Vec<TunnelStatus>>,
    pub bandwidth: Mutex<Vec<BandwidthSample>>,
    pub reconcile_total: AtomicU64,
    pub reconcile_errors: AtomicU64,
}

impl AgentState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_slices(&self) -> Vec<String> {
        let mut slices: Vec<String> = self
            .applied
            .lock()
            .expect("applied lock poisoned")
            .keys()
            .cloned()
            .collect();
        slices.sort();
        slices
    }
}

pub struct AgentReconciler {
    node: String,
    source: Arc<dyn ConfigSource>,
    shaper: TrafficController,
    tunnels: TunnelManager,
    state: Arc<AgentState>,
    kick: Arc<Notify>,
}

impl AgentReconciler {
    pub fn new(
        node: String,
        source: Arc<dyn ConfigSource>,
        runner: Arc<dyn CommandRunner>,
        state: Arc<AgentState>,
        kick: Arc<Notify>,
    ) -> Self {
        Self {
            node,
            source,
            shaper: TrafficController::new(runner.clone()),
            tunnels: TunnelManager::new(runner),
            state,
            kick,
        }
    }

    /// Single reconcile pass over all slices scoped to this node.
    pub async fn reconcile_once(&self) -> Result<()> {
        self.state.reconcile_total.fetch_add(1, Ordering::Relaxed);
        let configs = self.source.fetch(&self.node).await?;

        let mut applied = HashMap::new();
        for config in configs {
            match self.apply_slice(&config).await {
                Ok(()) => {
                    applied.insert(config.slice_id.clone(), config);
                }
                Err(err) => {
                    self.state.reconcile_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        slice = %sanitize_for_log(&config.slice_id),
                        error = %sanitize_for_log(&err.to_string()),
                        "slice configuration rejected"
                    );
                }
            }
        }

        let mut statuses = Vec::new();
        for config in applied.values() {
            for tunnel in &config.tunnels {
                if let Ok(status) = self.tunnels.tunnel_status(&tunnel.device).await {
                    statuses.push(status);
                }
            }
        }

        *self.state.applied.lock().expect("applied lock poisoned") = applied;
        *self.state.tunnels.lock().expect("tunnel lock poisoned") = statuses;
        Ok(())
    }

    async fn apply_slice(&self, config: &AgentConfig) -> Result<()> {
        config.validate()?;

        // tunnels first so overlay-scoped rules have a device to attach to
        for tunnel in &config.tunnels {
            self.tunnels.create_tunnel(tunnel).await?;
        }

        let rules = resolve_overlay_interfaces(config);
        let mut by_interface: HashMap<String, Vec<TcRule>> = HashMap::new();
        for rule in rules {
            by_interface
                .entry(rule.interface.clone())
                .or_default()
                .push(rule);
        }
        let mut interfaces: Vec<String> = by_interface.keys().cloned().collect();
        interfaces.sort();
        for interface in interfaces {
            let rules = &by_interface[&interface];
            self.shaper.apply(&interface, rules).await?;
        }
        Ok(())
    }

    /// Tear down every overlay device carrying this system's naming scheme.
    /// Runs at startup (to bound drift across restarts) and best-effort at
    /// shutdown.
    pub async fn sweep(&self) -> Result<()> {
        let devices = self.tunnels.list_managed_devices().await?;
        for device in devices {
            if let Err(err) = self.tunnels.delete_tunnel(&device).await {
                tracing::warn!(device = %device, error = %err, "sweep could not remove device");
            }
        }
        Ok(())
    }

    /// Run the reconcile loop until cancelled. A kick (out-of-band apply)
    /// triggers an immediate pass; ticks arriving mid-pass coalesce because
    /// one task owns the loop.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.kick.notified() => {}
            }
            if let Err(err) = self.reconcile_once().await {
                self.state.reconcile_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %err, "reconcile pass failed");
            }
        }
    }
}

/// Rewrite rules that reference the slice overlay to the concrete VXLAN
/// device derived from the slice VNI.
fn resolve_overlay_interfaces(config: &AgentConfig) -> Vec<TcRule> {
    config
        .tc_rules
        .iter()
        .cloned()
        .map(|mut rule| {
            if rule.interface == OVERLAY_INTERFACE {
                rule.interface = config.overlay_device();
            }
            rule
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mano_core::slice::{Direction, VxlanTunnel};
    use mano_exec::command::RecordingRunner;

    fn tc_rule(interface: &str) -> TcRule {
        TcRule {
            interface: interface.to_string(),
            direction: Direction::Egress,
            rate_kbit: 4000,
            burst_kb: 32,
            latency_ms: 5.0,
            jitter_ms: None,
            loss_percent: None,
            priority: 1,
            class_id: "1:10".to_string(),
            parent: "1:".to_string(),
            handle: "100:".to_string(),
            filter: None,
            commands: Vec::new(),
        }
    }

    fn slice_config(slice_id: &str, vni: u32, iface: &str) -> AgentConfig {
        AgentConfig {
            slice_id: slice_id.to_string(),
            vni,
            tc_rules: vec![tc_rule(iface)],
            tunnels: vec![VxlanTunnel {
                device: format!("vxlan{vni}"),
                vni,
                local_ip: "10.0.1.1".parse().unwrap(),
                remote_ips: vec!["10.0.1.2".parse().unwrap()],
                mtu: 1450,
                udp_port: 4789,
                learning: false,
                commands: Vec::new(),
            }],
            priority: 1,
        }
    }

    struct StaticSource(Vec<AgentConfig>);

    #[async_trait]
    impl ConfigSource for StaticSource {
        async fn fetch(&self, _node: &str) -> Result<Vec<AgentConfig>> {
            Ok(self.0.clone())
        }
    }

    fn reconciler(
        configs: Vec<AgentConfig>,
        runner: Arc<RecordingRunner>,
    ) -> (AgentReconciler, Arc<AgentState>) {
        let state = AgentState::new();
        let reconciler = AgentReconciler::new(
            "node01".to_string(),
            Arc::new(StaticSource(configs)),
            runner,
            state.clone(),
            Arc::new(Notify::new()),
        );
        (reconciler, state)
    }

    #[tokio::test]
    async fn overlay_rules_are_rewritten_to_the_vni_device() {
        let config = slice_config("embb-1", 150, OVERLAY_INTERFACE);
        let runner = Arc::new(RecordingRunner::new());
        let (reconciler, state) = reconciler(vec![config], runner.clone());

        reconciler.reconcile_once().await.unwrap();

        let lines = runner.command_lines();
        assert!(lines.iter().any(|l| l.contains("link add vxlan150")));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("tc qdisc add dev vxlan150 root")));
        assert_eq!(state.applied_slices(), vec!["embb-1".to_string()]);
    }

    #[tokio::test]
    async fn adversarial_interface_does_not_block_other_slices() {
        let good = slice_config("good-slice", 150, OVERLAY_INTERFACE);
        let mut bad = slice_config("bad-slice", 151, OVERLAY_INTERFACE);
        bad.tc_rules[0].interface = "eth0$(cat /etc/passwd)".to_string();

        let runner = Arc::new(RecordingRunner::new());
        let (reconciler, state) = reconciler(vec![bad, good], runner.clone());

        reconciler.reconcile_once().await.unwrap();

        // the hostile argument never reached a process invocation
        for (_, args) in runner.calls() {
            for arg in args {
                assert!(!arg.contains('$'), "unsanitized argument spawned: {arg}");
            }
        }
        assert_eq!(state.applied_slices(), vec!["good-slice".to_string()]);
        assert_eq!(state.reconcile_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn tunnels_are_applied_before_shaping_rules() {
        let config = slice_config("embb-2", 160, OVERLAY_INTERFACE);
        let runner = Arc::new(RecordingRunner::new());
        let (reconciler, _) = reconciler(vec![config], runner.clone());

        reconciler.reconcile_once().await.unwrap();

        let lines = runner.command_lines();
        let tunnel_idx = lines
            .iter()
            .position(|l| l.contains("link add vxlan160"))
            .unwrap();
        let shaping_idx = lines
            .iter()
            .position(|l| l.starts_with("tc qdisc add"))
            .unwrap();
        assert!(tunnel_idx < shaping_idx);
    }

    #[tokio::test]
    async fn sweep_removes_only_managed_devices() {
        let runner = Arc::new(RecordingRunner::new());
        runner.push_output(mano_exec::command::CommandOutput::with_stdout(
            "5: vxlan150@NONE: <UP> mtu 1450\n    link/ether aa:aa:aa:aa:aa:aa\n6: eth0: <UP> mtu 1500\n    link/ether bb:bb:bb:bb:bb:bb",
        ));
        let (reconciler, _) = reconciler(vec![], runner.clone());

        reconciler.sweep().await.unwrap();

        let lines = runner.command_lines();
        assert!(lines.iter().any(|l| l.contains("link del vxlan150")));
        assert!(!lines.iter().any(|l| l.contains("link del eth0")));
    }
}
