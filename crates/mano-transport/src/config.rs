//! Transport-network manager configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use mano_core::logging::LoggingConfig;
use mano_core::{ManoError, Result};

use crate::planner::NodeInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TnManagerConfig {
    pub listen_addr: String,
    /// First VNI handed out by the allocator.
    pub vni_start: u32,
    pub probe_enabled: bool,
    /// Interval between periodic compliance re-probes.
    pub probe_interval_secs: u64,
    pub nodes: HashMap<String, NodeEntry>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub agent_url: String,
    pub data_ip: IpAddr,
}

impl Default for TnManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8083".to_string(),
            vni_start: 100,
            probe_enabled: true,
            probe_interval_secs: 60,
            nodes: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TnManagerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ManoError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ManoError::Configuration(format!("malformed config: {e}")))
    }

    pub fn node_registry(&self) -> HashMap<String, NodeInfo> {
        self.nodes
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    NodeInfo {
                        name: name.clone(),
                        agent_url: entry.agent_url.trim_end_matches('/').to_string(),
                        data_ip: entry.data_ip,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_node_registry() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_addr: 127.0.0.1:9001\nvni_start: 200\nnodes:\n  edge01:\n    agent_url: http://10.0.1.1:8081/\n    data_ip: 10.0.1.1\n  edge02:\n    agent_url: http://10.0.1.2:8081\n    data_ip: 10.0.1.2\n"
        )
        .unwrap();
        let config = TnManagerConfig::load(file.path()).unwrap();
        let registry = config.node_registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry["edge01"].agent_url, "http://10.0.1.1:8081");
        assert_eq!(config.vni_start, 200);
    }
}
