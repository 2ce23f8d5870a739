//! Slice planning: VNI allocation and per-node configuration synthesis.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use mano_core::slice::{
    vxlan_overhead, AgentConfig, Direction, FilterSpec, SlicePriority, SliceTransportSpec, TcRule,
    VxlanTunnel, OVERLAY_INTERFACE, VNI_MAX, VNI_MIN,
};
use mano_core::{ManoError, Result};
use mano_exec::tc::clamp_tc_overhead;

/// Default shaping overhead assumed by the planner, clamped into the
/// published 2-8 % band.
const TC_OVERHEAD_DEFAULT: f64 = 0.05;

/// Fraction of the requested rate actually provisioned once encapsulation
/// and shaping overhead are budgeted.
pub fn effective_rate_factor(mtu: u32) -> f64 {
    (1.0 - vxlan_overhead(mtu) - clamp_tc_overhead(TC_OVERHEAD_DEFAULT)).max(0.5)
}

/// A participating node as known to the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub agent_url: String,
    pub data_ip: IpAddr,
}

/// Monotonic VNI allocator. A VNI is never reused while its slice is active.
pub struct VniAllocator {
    inner: Mutex<AllocatorState>,
}

struct AllocatorState {
    next: u32,
    active: HashMap<String, u32>,
    in_use: HashSet<u32>,
}

impl VniAllocator {
    pub fn new(start: u32) -> Self {
        Self {
            inner: Mutex::new(AllocatorState {
                next: start.max(VNI_MIN),
                active: HashMap::new(),
                in_use: HashSet::new(),
            }),
        }
    }

    /// VNI for a slice: the existing assignment if the slice is active,
    /// otherwise the next free value.
    pub fn assign(&self, slice_id: &str) -> Result<u32> {
        let mut state = self.inner.lock().expect("allocator lock poisoned");
        if let Some(vni) = state.active.get(slice_id) {
            return Ok(*vni);
        }
        while state.next <= VNI_MAX {
            let candidate = state.next;
            state.next += 1;
            if !state.in_use.contains(&candidate) {
                state.active.insert(slice_id.to_string(), candidate);
                state.in_use.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(ManoError::Resource {
            kind: "vni".to_string(),
            name: slice_id.to_string(),
            problem: "quota exceeded".to_string(),
        })
    }

    pub fn release(&self, slice_id: &str) {
        let mut state = self.inner.lock().expect("allocator lock poisoned");
        if let Some(vni) = state.active.remove(slice_id) {
            state.in_use.remove(&vni);
        }
    }

    pub fn lookup(&self, slice_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .active
            .get(slice_id)
            .copied()
    }
}

/// Shaping parameters derived from the slice priority class.
#[derive(Debug, Clone, Copy)]
pub struct ClassProfile {
    pub burst_kb: u64,
    pub htb_minor: u32,
}

pub fn class_profile(priority: SlicePriority) -> ClassProfile {
    match priority {
        SlicePriority::High => ClassProfile {
            burst_kb: 64,
            htb_minor: 10,
        },
        SlicePriority::Medium => ClassProfile {
            burst_kb: 32,
            htb_minor: 20,
        },
        SlicePriority::Low => ClassProfile {
            burst_kb: 16,
            htb_minor: 30,
        },
    }
}

/// Compute every participating node's configuration for a validated slice
/// spec. The returned map is keyed by node name.
pub fn plan_slice(
    spec: &SliceTransportSpec,
    vni: u32,
    nodes: &HashMap<String, NodeInfo>,
) -> Result<HashMap<String, AgentConfig>> {
    let mut missing: Vec<&String> = spec
        .endpoint_nodes
        .iter()
        .filter(|n| !nodes.contains_key(*n))
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(ManoError::Validation(format!(
            "unknown endpoint nodes: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let profile = class_profile(spec.priority);
    let mut plans = HashMap::new();

    for node_name in &spec.endpoint_nodes {
        let node = &nodes[node_name];
        let node_vni = spec.node_vnis.get(node_name).copied().unwrap_or(vni);
        let peers = peer_ips(spec, node_name, nodes);

        let tunnel = VxlanTunnel {
            device: mano_core::slice::vxlan_device_name(node_vni),
            vni: node_vni,
            local_ip: node.data_ip,
            remote_ips: peers,
            mtu: spec.mtu,
            udp_port: spec.tunnel_port,
            learning: false,
            commands: Vec::new(),
        };

        let class_id = format!("1:{}", profile.htb_minor);
        let rate_kbit = (spec.uplink_mbps * 1000.0 * effective_rate_factor(spec.mtu)) as u64;
        let uplink = TcRule {
            interface: OVERLAY_INTERFACE.to_string(),
            direction: Direction::Egress,
            rate_kbit,
            burst_kb: profile.burst_kb,
            latency_ms: spec.latency_budget_ms,
            jitter_ms: (spec.jitter_budget_ms > 0.0).then_some(spec.jitter_budget_ms),
            loss_percent: (spec.loss_tolerance_percent > 0.0)
                .then_some(spec.loss_tolerance_percent),
            priority: spec.priority.tc_priority(),
            class_id: class_id.clone(),
            parent: "1:".to_string(),
            handle: format!("{}0:", profile.htb_minor),
            filter: Some(FilterSpec {
                protocol: 17,
                src_ip: None,
                dst_ip: None,
                src_port: None,
                dst_port: u16::try_from(spec.tunnel_port).ok(),
            }),
            commands: render_rule_commands(&class_id, rate_kbit, spec),
        };

        let config = AgentConfig {
            slice_id: spec.slice_id.clone(),
            vni: node_vni,
            tc_rules: vec![uplink],
            tunnels: vec![tunnel],
            priority: spec.priority.tc_priority(),
        };
        config.validate()?;
        plans.insert(node_name.clone(), config);
    }
    Ok(plans)
}

/// Remote peer IPs for a node: the full mesh, or the hub relation when the
/// slice designates a hub.
fn peer_ips(
    spec: &SliceTransportSpec,
    node_name: &str,
    nodes: &HashMap<String, NodeInfo>,
) -> Vec<IpAddr> {
    match &spec.hub_node {
        Some(hub) if hub != node_name => vec![nodes[hub].data_ip],
        Some(_) => spec
            .endpoint_nodes
            .iter()
            .filter(|n| n.as_str() != node_name)
            .map(|n| nodes[n].data_ip)
            .collect(),
        None => spec
            .endpoint_nodes
            .iter()
            .filter(|n| n.as_str() != node_name)
            .map(|n| nodes[n].data_ip)
            .collect(),
    }
}

/// Human-inspectable command fragments mirroring what the agent executor will
/// program. Carried on the rule for operators and audit logs.
fn render_rule_commands(class_id: &str, rate_kbit: u64, spec: &SliceTransportSpec) -> Vec<String> {
    vec![
        format!("tc class add dev <overlay> parent 1: classid {class_id} htb rate {rate_kbit}kbit"),
        format!(
            "tc qdisc add dev <overlay> parent {class_id} netem delay {}ms",
            spec.latency_budget_ms
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[(&str, &str)]) -> HashMap<String, NodeInfo> {
        names
            .iter()
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

    fn spec(endpoints: &[&str]) -> SliceTransportSpec {
        SliceTransportSpec {
            slice_id: "embb-1".to_string(),
            endpoint_nodes: endpoints.iter().map(|s| s.to_string()).collect(),
            downlink_mbps: 4.57,
            uplink_mbps: 4.57,
            latency_budget_ms: 8.0,
            jitter_budget_ms: 2.0,
            loss_tolerance_percent: 0.5,
            priority: SlicePriority::Medium,
            node_vnis: HashMap::new(),
            tunnel_port: 4789,
            mtu: 1450,
            hub_node: None,
        }
    }

    #[test]
    fn allocator_is_monotonic_and_stable_per_slice() {
        let allocator = VniAllocator::new(100);
        let a = allocator.assign("slice-a").unwrap();
        let b = allocator.assign("slice-b").unwrap();
        assert_eq!(a, 100);
        assert_eq!(b, 101);
        // same slice gets the same vni back
        assert_eq!(allocator.assign("slice-a").unwrap(), a);

        // release does not recycle into an active slice's value
        allocator.release("slice-a");
        let c = allocator.assign("slice-c").unwrap();
        assert_eq!(c, 102);
    }

    #[test]
    fn full_mesh_peers_exclude_self() {
        let nodes = nodes(&[
            ("edge01", "10.0.1.1"),
            ("edge02", "10.0.1.2"),
            ("reg01", "10.0.1.3"),
        ]);
        let plans = plan_slice(&spec(&["edge01", "edge02", "reg01"]), 150, &nodes).unwrap();
        assert_eq!(plans.len(), 3);

        let edge01 = &plans["edge01"];
        let peers = &edge01.tunnels[0].remote_ips;
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(&"10.0.1.1".parse().unwrap()));
    }

    #[test]
    fn hub_and_spoke_topology() {
        let nodes = nodes(&[
            ("hub", "10.0.2.1"),
            ("spoke1", "10.0.2.2"),
            ("spoke2", "10.0.2.3"),
        ]);
        let mut spec = spec(&["hub", "spoke1", "spoke2"]);
        spec.hub_node = Some("hub".to_string());

        let plans = plan_slice(&spec, 151, &nodes).unwrap();
        assert_eq!(plans["spoke1"].tunnels[0].remote_ips, vec!["10.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(plans["hub"].tunnels[0].remote_ips.len(), 2);
    }

    #[test]
    fn rules_budget_for_encapsulation_and_shaping_overhead() {
        let nodes = nodes(&[("edge01", "10.0.1.1"), ("edge02", "10.0.1.2")]);
        let plans = plan_slice(&spec(&["edge01", "edge02"]), 150, &nodes).unwrap();
        let rule = &plans["edge01"].tc_rules[0];
        assert_eq!(rule.interface, OVERLAY_INTERFACE);

        let expected = (4.57 * 1000.0 * effective_rate_factor(1450)) as u64;
        assert_eq!(rule.rate_kbit, expected);
        // overhead never swallows more than half of the envelope
        assert!(rule.rate_kbit < 4570);
        assert!(rule.rate_kbit > 4570 / 2);

        assert_eq!(rule.priority, SlicePriority::Medium.tc_priority());
        assert_eq!(rule.filter.as_ref().unwrap().dst_port, Some(4789));
        assert!(!rule.commands.is_empty());
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let nodes = nodes(&[("edge01", "10.0.1.1")]);
        let err = plan_slice(&spec(&["edge01", "ghost"]), 150, &nodes).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
