//! Slice transport model.
//!
//! A slice transport spec is what the orchestrator hands to the
//! transport-network manager; a per-agent configuration object is what the
//! manager derives from it for each participating node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{ManoError, Result};

pub const VNI_MIN: u32 = 1;
pub const VNI_MAX: u32 = (1 << 24) - 1;
pub const MTU_MIN: u32 = 576;
pub const MTU_MAX: u32 = 9000;
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Kernel interface names: alphanumeric plus `._-`, at most 15 characters.
pub fn valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

pub fn validate_vni(vni: u32) -> Result<()> {
    if !(VNI_MIN..=VNI_MAX).contains(&vni) {
        return Err(ManoError::Validation(format!(
            "vni {} outside allowed range [{}, {}]",
            vni, VNI_MIN, VNI_MAX
        )));
    }
    Ok(())
}

pub fn validate_mtu(mtu: u32) -> Result<()> {
    if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
        return Err(ManoError::Validation(format!(
            "mtu {} outside allowed range [{}, {}]",
            mtu, MTU_MIN, MTU_MAX
        )));
    }
    Ok(())
}

pub fn validate_udp_port(port: u32) -> Result<()> {
    if !(1..=65535).contains(&port) {
        return Err(ManoError::Validation(format!(
            "udp port {} outside allowed range [1, 65535]",
            port
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlicePriority {
    High,
    Medium,
    Low,
}

impl SlicePriority {
    /// HTB class priority used when rendering traffic-control rules.
    pub fn tc_priority(&self) -> u32 {
        match self {
            SlicePriority::High => 1,
            SlicePriority::Medium => 2,
            SlicePriority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// End-to-end transport requirements for one slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceTransportSpec {
    pub slice_id: String,
    /// Participating node names, keyed into `node_vnis` and the endpoint map.
    pub endpoint_nodes: Vec<String>,
    pub downlink_mbps: f64,
    pub uplink_mbps: f64,
    pub latency_budget_ms: f64,
    pub jitter_budget_ms: f64,
    pub loss_tolerance_percent: f64,
    pub priority: SlicePriority,
    /// Node name -> overlay VNI. Populated by the manager's allocator when
    /// absent on submission.
    #[serde(default)]
    pub node_vnis: HashMap<String, u32>,
    pub tunnel_port: u32,
    pub mtu: u32,
    /// Optional hub node; when set, tunnels form a hub-and-spoke instead of a
    /// full mesh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_node: Option<String>,
}

impl SliceTransportSpec {
    pub fn validate(&self) -> Result<()> {
        if self.slice_id.is_empty() {
            return Err(ManoError::Validation("slice id must not be empty".into()));
        }
        if self.endpoint_nodes.len() < 2 {
            return Err(ManoError::Validation(
                "a slice needs at least two endpoint nodes".into(),
            ));
        }
        if self.downlink_mbps <= 0.0 || self.uplink_mbps <= 0.0 {
            return Err(ManoError::Validation(
                "per-direction bandwidth must be positive".into(),
            ));
        }
        if self.latency_budget_ms <= 0.0 {
            return Err(ManoError::Validation(
                "latency budget must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.loss_tolerance_percent) {
            return Err(ManoError::Validation(
                "loss tolerance must be a percentage".into(),
            ));
        }
        validate_udp_port(self.tunnel_port)?;
        validate_mtu(self.mtu)?;
        for vni in self.node_vnis.values() {
            validate_vni(*vni)?;
        }
        if let Some(hub) = &self.hub_node {
            if !self.endpoint_nodes.contains(hub) {
                return Err(ManoError::Validation(format!(
                    "hub node {} is not an endpoint of the slice",
                    hub
                )));
            }
        }
        Ok(())
    }
}

/// Protocol + 5-tuple classifier attached to a shaping class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// IP protocol number (17 = UDP, 6 = TCP).
    pub protocol: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
}

/// One traffic-control rule as applied on a node interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcRule {
    pub interface: String,
    pub direction: Direction,
    pub rate_kbit: u64,
    pub burst_kb: u64,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_percent: Option<f64>,
    pub priority: u32,
    pub class_id: String,
    pub parent: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSpec>,
    /// Rendered `tc` fragments, in apply order. Produced by the planner so
    /// agents can log exactly what will run.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl TcRule {
    pub fn validate(&self) -> Result<()> {
        if !valid_interface_name(&self.interface) {
            return Err(ManoError::Validation(format!(
                "invalid interface name {:?}",
                crate::sanitize::sanitize_for_log(&self.interface)
            )));
        }
        if self.rate_kbit == 0 {
            return Err(ManoError::Validation("tc rate must be positive".into()));
        }
        if self.burst_kb == 0 {
            return Err(ManoError::Validation("tc burst must be positive".into()));
        }
        if self.priority == 0 {
            return Err(ManoError::Validation("tc priority must be >= 1".into()));
        }
        if let Some(loss) = self.loss_percent {
            if !(0.0..=100.0).contains(&loss) {
                return Err(ManoError::Validation("loss must be a percentage".into()));
            }
        }
        Ok(())
    }
}

/// One VXLAN tunnel as applied on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VxlanTunnel {
    pub device: String,
    pub vni: u32,
    pub local_ip: IpAddr,
    pub remote_ips: Vec<IpAddr>,
    pub mtu: u32,
    pub udp_port: u32,
    #[serde(default)]
    pub learning: bool,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl VxlanTunnel {
    pub fn validate(&self) -> Result<()> {
        if !valid_interface_name(&self.device) {
            return Err(ManoError::Validation(format!(
                "invalid tunnel device name {:?}",
                crate::sanitize::sanitize_for_log(&self.device)
            )));
        }
        validate_vni(self.vni)?;
        validate_mtu(self.mtu)?;
        validate_udp_port(self.udp_port)?;
        if self.remote_ips.is_empty() {
            return Err(ManoError::Validation(
                "tunnel needs at least one remote peer".into(),
            ));
        }
        Ok(())
    }
}

/// Everything one node agent must materialize for a slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub slice_id: String,
    pub vni: u32,
    pub tc_rules: Vec<TcRule>,
    pub tunnels: Vec<VxlanTunnel>,
    pub priority: u32,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slice_id.is_empty() {
            return Err(ManoError::Validation("slice id must not be empty".into()));
        }
        validate_vni(self.vni)?;
        if self.priority == 0 {
            return Err(ManoError::Validation(
                "scheduling priority must be >= 1".into(),
            ));
        }
        for rule in &self.tc_rules {
            rule.validate()?;
        }
        for tunnel in &self.tunnels {
            tunnel.validate()?;
        }
        Ok(())
    }

    /// Device name an overlay reference resolves to on this node.
    pub fn overlay_device(&self) -> String {
        vxlan_device_name(self.vni)
    }
}

/// Naming scheme for overlay devices managed by this system. The agent's
/// startup/shutdown sweep matches on this prefix.
pub const VXLAN_DEVICE_PREFIX: &str = "vxlan";

/// Sentinel interface name in a TC rule meaning "this slice's overlay
/// device". Agents rewrite it to the VNI-derived device name before applying.
pub const OVERLAY_INTERFACE: &str = "overlay";

pub fn vxlan_device_name(vni: u32) -> String {
    format!("{}{}", VXLAN_DEVICE_PREFIX, vni)
}

/// VXLAN encapsulation overhead fraction for a given MTU:
/// 8 (VXLAN) + 8 (UDP) + 20 (IP) + 14 (inner Ethernet) bytes per frame.
pub fn vxlan_overhead(mtu: u32) -> f64 {
    f64::from(8 + 8 + 20 + 14) / f64::from(mtu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_rules() {
        assert!(valid_interface_name("vxlan0"));
        assert!(valid_interface_name("eth0.100"));
        assert!(valid_interface_name("br-slice_1"));
        assert!(!valid_interface_name("eth0; rm -rf /"));
        assert!(!valid_interface_name("eth0$(cat /etc/passwd)"));
        assert!(!valid_interface_name(""));
        assert!(!valid_interface_name("interfacename16ch"));
    }

    #[test]
    fn vni_boundaries() {
        assert!(validate_vni(0).is_err());
        assert!(validate_vni(1).is_ok());
        assert!(validate_vni((1 << 24) - 1).is_ok());
        assert!(validate_vni(1 << 24).is_err());
    }

    #[test]
    fn mtu_boundaries() {
        assert!(validate_mtu(575).is_err());
        assert!(validate_mtu(576).is_ok());
        assert!(validate_mtu(9000).is_ok());
        assert!(validate_mtu(9001).is_err());
    }

    #[test]
    fn overhead_model() {
        let overhead = vxlan_overhead(1450);
        assert!((overhead - 50.0 / 1450.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tunnel_validation_catches_bad_device() {
        let tunnel = VxlanTunnel {
            device: "vxlan100; true".to_string(),
            vni: 100,
            local_ip: "10.0.0.1".parse().unwrap(),
            remote_ips: vec!["10.0.0.2".parse().unwrap()],
            mtu: 1450,
            udp_port: 4789,
            learning: false,
            commands: Vec::new(),
        };
        assert!(tunnel.validate().is_err());
    }

    #[test]
    fn transport_spec_requires_two_endpoints() {
        let spec = SliceTransportSpec {
            slice_id: "embb-1".to_string(),
            endpoint_nodes: vec!["edge01".to_string()],
            downlink_mbps: 4.0,
            uplink_mbps: 2.0,
            latency_budget_ms: 10.0,
            jitter_budget_ms: 2.0,
            loss_tolerance_percent: 0.5,
            priority: SlicePriority::High,
            node_vnis: HashMap::new(),
            tunnel_port: 4789,
            mtu: 1450,
            hub_node: None,
        };
        assert!(spec.validate().is_err());
    }
}
