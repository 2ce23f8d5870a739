//! VXLAN overlay programming.

use mano_core::slice::{vxlan_overhead, VxlanTunnel, VXLAN_DEVICE_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::command::{expect_success, is_not_found_output, CommandRunner};
use crate::stats::{parse_fdb, parse_link_names, parse_link_stats, FdbEntry, InterfaceStats};
use crate::validate::{validate_interface, ExecError, ExecResult};

/// The all-zero MAC used for default forwarding-database entries.
const ZERO_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub device: String,
    pub up: bool,
    pub stats: InterfaceStats,
    pub peers: Vec<IpAddr>,
}

pub struct TunnelManager {
    runner: Arc<dyn CommandRunner>,
}

impl TunnelManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Create a VXLAN device and point a default forwarding entry at every
    /// remote peer. Safe to call repeatedly: an existing device is kept and
    /// its peer set is converged instead.
    pub async fn create_tunnel(&self, cfg: &VxlanTunnel) -> ExecResult<()> {
        cfg.validate()
            .map_err(|e| ExecError::InvalidInput(e.to_string()))?;

        let mut args: Vec<String> = vec![
            "link".into(),
            "add".into(),
            cfg.device.clone(),
            "type".into(),
            "vxlan".into(),
            "id".into(),
            cfg.vni.to_string(),
            "local".into(),
            cfg.local_ip.to_string(),
            "dstport".into(),
            cfg.udp_port.to_string(),
        ];
        if !cfg.learning {
            args.push("nolearning".into());
        }
        let output = self.runner.run("ip", &args).await?;
        let already_exists = !output.success()
            && output.stderr.to_ascii_lowercase().contains("file exists");
        if !output.success() && !already_exists {
            return Err(ExecError::ExecFailed {
                command: "ip".to_string(),
                status: output.status,
                stderr: mano_core::sanitize::sanitize_for_log(&output.stderr),
            });
        }

        self.ip(&["link", "set", &cfg.device, "mtu", &cfg.mtu.to_string()])
            .await?;
        self.ip(&["link", "set", &cfg.device, "up"]).await?;

        if already_exists {
            // converge the peer set of the surviving device
            self.update_peers(&cfg.device, &cfg.remote_ips).await?;
        } else {
            for peer in &cfg.remote_ips {
                self.fdb_append(&cfg.device, *peer).await?;
            }
        }
        tracing::info!(device = %cfg.device, vni = cfg.vni, peers = cfg.remote_ips.len(), "vxlan tunnel ready");
        Ok(())
    }

    /// Remove a tunnel device; absence is success.
    pub async fn delete_tunnel(&self, device: &str) -> ExecResult<()> {
        validate_interface(device)?;
        let output = self
            .runner
            .run(
                "ip",
                &["link".to_string(), "del".to_string(), device.to_string()],
            )
            .await?;
        if output.success() || is_not_found_output(&output) {
            Ok(())
        } else {
            Err(ExecError::ExecFailed {
                command: "ip".to_string(),
                status: output.status,
                stderr: mano_core::sanitize::sanitize_for_log(&output.stderr),
            })
        }
    }

    /// Delta-apply the default forwarding entries so the device's peer set
    /// matches `desired`.
    pub async fn update_peers(&self, device: &str, desired: &[IpAddr]) -> ExecResult<()> {
        validate_interface(device)?;
        let current: HashSet<IpAddr> = self
            .fdb_entries(device)
            .await?
            .into_iter()
            .filter(|e| e.mac == ZERO_MAC)
            .filter_map(|e| e.dst)
            .collect();
        let desired: HashSet<IpAddr> = desired.iter().copied().collect();

        for peer in desired.difference(&current) {
            self.fdb_append(device, *peer).await?;
        }
        for peer in current.difference(&desired) {
            self.bridge(&[
                "fdb",
                "del",
                ZERO_MAC,
                "dev",
                device,
                "dst",
                &peer.to_string(),
            ])
            .await?;
        }
        Ok(())
    }

    pub async fn tunnel_status(&self, device: &str) -> ExecResult<TunnelStatus> {
        validate_interface(device)?;
        let output = self
            .runner
            .run(
                "ip",
                &[
                    "-s".to_string(),
                    "link".to_string(),
                    "show".to_string(),
                    "dev".to_string(),
                    device.to_string(),
                ],
            )
            .await?;
        let output = expect_success("ip", output)?;
        let stats = parse_link_stats(&output.stdout)?;
        let peers = self
            .fdb_entries(device)
            .await?
            .into_iter()
            .filter(|e| e.mac == ZERO_MAC)
            .filter_map(|e| e.dst)
            .collect();
        Ok(TunnelStatus {
            device: device.to_string(),
            up: stats.up,
            stats,
            peers,
        })
    }

    /// All VXLAN devices the kernel knows about that carry this system's
    /// naming prefix. Used by the agent's startup/shutdown sweep.
    pub async fn list_managed_devices(&self) -> ExecResult<Vec<String>> {
        let output = self
            .runner
            .run(
                "ip",
                &[
                    "-d".to_string(),
                    "link".to_string(),
                    "show".to_string(),
                    "type".to_string(),
                    "vxlan".to_string(),
                ],
            )
            .await?;
        let output = expect_success("ip", output)?;
        Ok(parse_link_names(&output.stdout)
            .into_iter()
            .filter(|name| {
                name.starts_with(VXLAN_DEVICE_PREFIX)
                    && name[VXLAN_DEVICE_PREFIX.len()..].parse::<u32>().is_ok()
            })
            .collect())
    }

    /// ICMP reachability per peer.
    pub async fn test_connectivity(&self, peers: &[IpAddr]) -> Vec<(IpAddr, bool)> {
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            let reachable = match self
                .runner
                .run(
                    "ping",
                    &[
                        "-c".to_string(),
                        "1".to_string(),
                        "-W".to_string(),
                        "1".to_string(),
                        peer.to_string(),
                    ],
                )
                .await
            {
                Ok(output) => output.success(),
                Err(_) => false,
            };
            results.push((*peer, reachable));
        }
        results
    }

    /// Fraction of a frame consumed by VXLAN encapsulation at this MTU.
    pub fn overhead(mtu: u32) -> f64 {
        vxlan_overhead(mtu)
    }

    async fn fdb_entries(&self, device: &str) -> ExecResult<Vec<FdbEntry>> {
        let output = self
            .runner
            .run(
                "bridge",
                &[
                    "fdb".to_string(),
                    "show".to_string(),
                    "dev".to_string(),
                    device.to_string(),
                ],
            )
            .await?;
        let output = expect_success("bridge", output)?;
        Ok(parse_fdb(&output.stdout))
    }

    async fn fdb_append(&self, device: &str, peer: IpAddr) -> ExecResult<()> {
        self.bridge(&[
            "fdb",
            "append",
            ZERO_MAC,
            "dev",
            device,
            "dst",
            &peer.to_string(),
        ])
        .await
    }

    async fn bridge(&self, args: &[&str]) -> ExecResult<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.runner.run("bridge", &args).await?;
        expect_success("bridge", output)?;
        Ok(())
    }

    async fn ip(&self, args: &[&str]) -> ExecResult<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.runner.run("ip", &args).await?;
        expect_success("ip", output)?;
        Ok(())
    }
}
