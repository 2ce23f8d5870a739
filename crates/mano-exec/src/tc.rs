//! Hierarchical token-bucket shaping with optional network emulation.

use mano_core::slice::TcRule;
use std::sync::Arc;

use crate::command::{expect_success, is_not_found_output, CommandRunner};
use crate::stats::{parse_link_stats, parse_qdisc_stats, InterfaceStats, QdiscStats};
use crate::validate::{validate_interface, ExecError, ExecResult};

/// Handle of the HTB root qdisc.
const ROOT_HANDLE: &str = "1:";
/// Class id of the default (unclassified) traffic class.
const DEFAULT_CLASS: &str = "1:999";

/// Fraction band reserved for shaping overhead, published for upstream
/// planners. Configurable between 2 and 8 percent.
pub const TC_OVERHEAD_MIN: f64 = 0.02;
pub const TC_OVERHEAD_MAX: f64 = 0.08;

pub fn clamp_tc_overhead(requested: f64) -> f64 {
    requested.clamp(TC_OVERHEAD_MIN, TC_OVERHEAD_MAX)
}

pub struct TrafficController {
    runner: Arc<dyn CommandRunner>,
}

impl TrafficController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Install shaping for `interface`. Idempotent: any existing root and
    /// ingress qdisc is cleared first, then the full hierarchy is
    /// re-programmed, so two identical applies converge to the same kernel
    /// state as one.
    pub async fn apply(&self, interface: &str, rules: &[TcRule]) -> ExecResult<()> {
        validate_interface(interface)?;
        for rule in rules {
            rule.validate()
                .map_err(|e| ExecError::InvalidInput(e.to_string()))?;
            if rule.interface != interface {
                return Err(ExecError::InvalidInput(format!(
                    "rule targets interface {:?}, expected {:?}",
                    mano_core::sanitize::sanitize_for_log(&rule.interface),
                    mano_core::sanitize::sanitize_for_log(interface)
                )));
            }
        }

        self.clear(interface).await?;

        // root HTB with unclassified traffic falling into the default class
        self.tc(&[
            "qdisc", "add", "dev", interface, "root", "handle", ROOT_HANDLE, "htb", "default",
            "999",
        ])
        .await?;
        self.tc(&[
            "class",
            "add",
            "dev",
            interface,
            "parent",
            ROOT_HANDLE,
            "classid",
            DEFAULT_CLASS,
            "htb",
            "rate",
            "1000mbit",
        ])
        .await?;

        for rule in rules {
            self.apply_rule(interface, rule).await?;
        }
        tracing::info!(interface, rules = rules.len(), "traffic shaping applied");
        Ok(())
    }

    async fn apply_rule(&self, interface: &str, rule: &TcRule) -> ExecResult<()> {
        let rate = format!("{}kbit", rule.rate_kbit);
        let burst = format!("{}k", rule.burst_kb);
        let prio = rule.priority.to_string();
        self.tc(&[
            "class", "add", "dev", interface, "parent", &rule.parent, "classid", &rule.class_id,
            "htb", "rate", &rate, "burst", &burst, "prio", &prio,
        ])
        .await?;

        if rule.latency_ms > 0.0 || rule.jitter_ms.is_some() || rule.loss_percent.is_some() {
            let mut args: Vec<String> = vec![
                "qdisc".into(),
                "add".into(),
                "dev".into(),
                interface.into(),
                "parent".into(),
                rule.class_id.clone(),
                "handle".into(),
                rule.handle.clone(),
                "netem".into(),
            ];
            if rule.latency_ms > 0.0 {
                args.push("delay".into());
                args.push(format!("{}ms", rule.latency_ms));
                if let Some(jitter) = rule.jitter_ms {
                    args.push(format!("{}ms", jitter));
                }
            }
            if let Some(loss) = rule.loss_percent {
                if loss > 0.0 {
                    args.push("loss".into());
                    args.push(format!("{}%", loss));
                }
            }
            let output = self.runner.run("tc", &args).await?;
            expect_success("tc", output)?;
        }

        if let Some(filter) = &rule.filter {
            let mut args: Vec<String> = vec![
                "filter".into(),
                "add".into(),
                "dev".into(),
                interface.into(),
                "protocol".into(),
                "ip".into(),
                "parent".into(),
                rule.parent.clone(),
                "prio".into(),
                rule.priority.to_string(),
                "u32".into(),
                "match".into(),
                "ip".into(),
                "protocol".into(),
                filter.protocol.to_string(),
                "0xff".into(),
            ];
            if let Some(src) = filter.src_ip {
                args.extend(["match".into(), "ip".into(), "src".into(), src.to_string()]);
            }
            if let Some(dst) = filter.dst_ip {
                args.extend(["match".into(), "ip".into(), "dst".into(), dst.to_string()]);
            }
            if let Some(sport) = filter.src_port {
                args.extend([
                    "match".into(),
                    "ip".into(),
                    "sport".into(),
                    sport.to_string(),
                    "0xffff".into(),
                ]);
            }
            if let Some(dport) = filter.dst_port {
                args.extend([
                    "match".into(),
                    "ip".into(),
                    "dport".into(),
                    dport.to_string(),
                    "0xffff".into(),
                ]);
            }
            args.push("flowid".into());
            args.push(rule.class_id.clone());
            let output = self.runner.run("tc", &args).await?;
            expect_success("tc", output)?;
        }
        Ok(())
    }

    /// Remove the root and ingress qdisc, tolerating their absence.
    pub async fn clear(&self, interface: &str) -> ExecResult<()> {
        validate_interface(interface)?;
        for target in [vec!["root"], vec!["ingress"]] {
            let mut args: Vec<String> = vec![
                "qdisc".into(),
                "del".into(),
                "dev".into(),
                interface.into(),
            ];
            args.extend(target.into_iter().map(String::from));
            let output = self.runner.run("tc", &args).await?;
            if !output.success() && !is_not_found_output(&output) {
                return Err(ExecError::ExecFailed {
                    command: "tc".to_string(),
                    status: output.status,
                    stderr: mano_core::sanitize::sanitize_for_log(&output.stderr),
                });
            }
        }
        Ok(())
    }

    /// Per-qdisc shaping statistics for an interface.
    pub async fn shaping_status(&self, interface: &str) -> ExecResult<Vec<QdiscStats>> {
        validate_interface(interface)?;
        let output = self
            .runner
            .run(
                "tc",
                &[
                    "-s".to_string(),
                    "qdisc".to_string(),
                    "show".to_string(),
                    "dev".to_string(),
                    interface.to_string(),
                ],
            )
            .await?;
        let output = expect_success("tc", output)?;
        Ok(parse_qdisc_stats(&output.stdout))
    }

    /// Link state and counters for an interface.
    pub async fn status(&self, interface: &str) -> ExecResult<InterfaceStats> {
        validate_interface(interface)?;
        let output = self
            .runner
            .run(
                "ip",
                &[
                    "-s".to_string(),
                    "link".to_string(),
                    "show".to_string(),
                    "dev".to_string(),
                    interface.to_string(),
                ],
            )
            .await?;
        let output = expect_success("ip", output)?;
        parse_link_stats(&output.stdout)
    }

    async fn tc(&self, args: &[&str]) -> ExecResult<()> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.runner.run("tc", &args).await?;
        expect_success("tc", output)?;
        Ok(())
    }
}
