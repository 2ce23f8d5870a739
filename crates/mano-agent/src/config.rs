//! Node agent configuration file.
//!
//! YAML with the agent/vxlan/bandwidth/monitoring/logging sections. Unknown
//! keys are tolerated so configs can carry forward-compatible fields;
//! malformed YAML is fatal at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use mano_core::logging::LoggingConfig;
use mano_core::{ManoError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSection {
    pub cluster_name: String,
    pub node_name: String,
    pub network_cidr: String,
    pub monitoring_port: u16,
    pub qos_class: String,
    pub interfaces: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            cluster_name: "edge01".to_string(),
            node_name: "node01".to_string(),
            network_cidr: "10.0.0.0/24".to_string(),
            monitoring_port: 8081,
            qos_class: "standard".to_string(),
            interfaces: vec!["eth0".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VxlanSection {
    pub vni: u32,
    pub remote_ips: Vec<String>,
    pub local_ip: String,
    pub port: u32,
    pub mtu: u32,
    pub device_name: String,
    pub learning: bool,
}

impl Default for VxlanSection {
    fn default() -> Self {
        Self {
            vni: 100,
            remote_ips: Vec::new(),
            local_ip: "10.0.0.1".to_string(),
            port: 4789,
            mtu: 1450,
            device_name: "vxlan100".to_string(),
            learning: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BandwidthSection {
    pub downlink_mbps: f64,
    pub uplink_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub priority: u32,
    pub queue_class: String,
    pub filters: Vec<String>,
}

impl Default for BandwidthSection {
    fn default() -> Self {
        Self {
            downlink_mbps: 4.0,
            uplink_mbps: 2.0,
            latency_ms: 8.0,
            jitter_ms: 2.0,
            loss_percent: 0.0,
            priority: 2,
            queue_class: "1:10".to_string(),
            filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitoringSection {
    pub enabled: bool,
    #[serde(alias = "interval")]
    pub interval_secs: u64,
    pub metrics_port: u16,
    pub export_directory: Option<PathBuf>,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            metrics_port: 9100,
            export_directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentFileConfig {
    pub agent: AgentSection,
    pub vxlan: VxlanSection,
    pub bandwidth: BandwidthSection,
    pub monitoring: MonitoringSection,
    pub logging: LoggingConfig,
    /// Directory watched for distributed per-slice configuration objects.
    pub config_dir: Option<PathBuf>,
    /// Reconcile tick, seconds.
    pub reconcile_interval_secs: Option<u64>,
}

impl AgentFileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ManoError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ManoError::Configuration(format!("malformed config: {e}")))
    }

    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_interval_secs.unwrap_or(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_full_config_with_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "agent:\n  clusterName: edge02\n  nodeName: node07\n  monitoringPort: 9090\n  someFutureKey: 1\nvxlan:\n  vni: 250\n  localIp: 192.168.7.3\n  remoteIps: [192.168.7.4]\nbandwidth:\n  downlinkMbps: 4.57\nmonitoring:\n  enabled: false\nlogging:\n  level: debug\n"
        )
        .unwrap();
        let config = AgentFileConfig::load(file.path()).unwrap();
        assert_eq!(config.agent.cluster_name, "edge02");
        assert_eq!(config.agent.node_name, "node07");
        assert_eq!(config.vxlan.vni, 250);
        assert!((config.bandwidth.downlink_mbps - 4.57).abs() < 1e-9);
        assert!(!config.monitoring.enabled);
        assert_eq!(config.logging.level, "debug");
        // untouched sections keep their defaults
        assert_eq!(config.vxlan.port, 4789);
    }

    #[test]
    fn malformed_yaml_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "agent: [well, this is not a mapping").unwrap();
        assert!(AgentFileConfig::load(file.path()).is_err());
    }
}
