//! Synthetic throughput and latency probes.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use crate::command::{expect_success, CommandRunner};
use crate::validate::{validate_port_arg, ExecError, ExecResult};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub mdev_ms: f64,
    pub loss_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbeResult {
    pub throughput_mbps: f64,
    pub latency: LatencyStats,
}

pub struct Prober {
    runner: Arc<dyn CommandRunner>,
}

impl Prober {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// iperf3 client probe against a peer agent's iperf server.
    pub async fn throughput_mbps(
        &self,
        host: IpAddr,
        port: u16,
        duration_secs: u32,
    ) -> ExecResult<f64> {
        validate_port_arg(u32::from(port))?;
        let output = self
            .runner
            .run(
                "iperf3",
                &[
                    "-c".to_string(),
                    host.to_string(),
                    "-p".to_string(),
                    port.to_string(),
                    "-t".to_string(),
                    duration_secs.to_string(),
                    "-J".to_string(),
                ],
            )
            .await?;
        let output = expect_success("iperf3", output)?;
        parse_iperf3_mbps(&output.stdout)
    }

    /// ICMP round-trip statistics against a peer.
    pub async fn latency(&self, host: IpAddr, count: u32) -> ExecResult<LatencyStats> {
        let output = self
            .runner
            .run(
                "ping",
                &[
                    "-c".to_string(),
                    count.to_string(),
                    "-i".to_string(),
                    "0.2".to_string(),
                    host.to_string(),
                ],
            )
            .await?;
        // ping exits non-zero on 100% loss; the summary is still parseable
        parse_ping_stats(&output.stdout)
    }

    /// Combined probe used by the agent `/test` handler and the
    /// transport-network manager's compliance check.
    pub async fn probe(
        &self,
        host: IpAddr,
        port: u16,
        duration_secs: u32,
    ) -> ExecResult<ProbeResult> {
        let latency = self.latency(host, 5).await?;
        let throughput_mbps = self.throughput_mbps(host, port, duration_secs).await?;
        Ok(ProbeResult {
            throughput_mbps,
            latency,
        })
    }
}

/// Extract received throughput from `iperf3 -J` output.
pub fn parse_iperf3_mbps(json: &str) -> ExecResult<f64> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ExecError::ParseFailed {
            what: "iperf3".to_string(),
            detail: e.to_string(),
        })?;
    let bps = value
        .pointer("/end/sum_received/bits_per_second")
        .or_else(|| value.pointer("/end/sum/bits_per_second"))
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| ExecError::ParseFailed {
            what: "iperf3".to_string(),
            detail: "missing end.sum_received.bits_per_second".to_string(),
        })?;
    Ok(bps / 1_000_000.0)
}

/// Extract rtt and loss from ping's summary block.
pub fn parse_ping_stats(output: &str) -> ExecResult<LatencyStats> {
    let mut stats = LatencyStats::default();
    let mut have_rtt = false;
    let mut have_loss = false;

    for line in output.lines() {
        if let Some(idx) = line.find("% packet loss") {
            let prefix = &line[..idx];
            if let Some(loss) = prefix.rsplit([' ', ',']).next() {
                if let Ok(value) = loss.trim().parse::<f64>() {
                    stats.loss_percent = value;
                    have_loss = true;
                }
            }
        }
        if line.starts_with("rtt min/avg/max/mdev") || line.starts_with("round-trip min/avg/max") {
            if let Some(values) = line.split('=').nth(1) {
                let values = values.trim().trim_end_matches(" ms");
                let parts: Vec<f64> = values
                    .split('/')
                    .filter_map(|v| v.trim().parse::<f64>().ok())
                    .collect();
                if parts.len() >= 3 {
                    stats.min_ms = parts[0];
                    stats.avg_ms = parts[1];
                    stats.max_ms = parts[2];
                    stats.mdev_ms = parts.get(3).copied().unwrap_or(0.0);
                    have_rtt = true;
                }
            }
        }
    }

    if have_loss && stats.loss_percent >= 100.0 {
        // total loss: no rtt line exists, report loss alone
        return Ok(stats);
    }
    if !have_rtt {
        return Err(ExecError::ParseFailed {
            what: "ping".to_string(),
            detail: "missing rtt summary".to_string(),
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingRunner};

    const PING_OUTPUT: &str = "\
PING 10.0.1.2 (10.0.1.2) 56(84) bytes of data.
64 bytes from 10.0.1.2: icmp_seq=1 ttl=64 time=16.1 ms
64 bytes from 10.0.1.2: icmp_seq=2 ttl=64 time=15.9 ms

--- 10.0.1.2 ping statistics ---
5 packets transmitted, 5 received, 0% packet loss, time 804ms
rtt min/avg/max/mdev = 15.903/16.120/16.402/0.183 ms";

    #[test]
    fn parses_ping_summary() {
        let stats = parse_ping_stats(PING_OUTPUT).unwrap();
        assert!((stats.avg_ms - 16.12).abs() < 1e-9);
        assert!((stats.min_ms - 15.903).abs() < 1e-9);
        assert_eq!(stats.loss_percent, 0.0);
    }

    #[test]
    fn parses_total_loss() {
        let output = "\
PING 10.0.9.9 (10.0.9.9) 56(84) bytes of data.

--- 10.0.9.9 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4096ms";
        let stats = parse_ping_stats(output).unwrap();
        assert_eq!(stats.loss_percent, 100.0);
        assert_eq!(stats.avg_ms, 0.0);
    }

    #[test]
    fn parses_iperf3_json() {
        let json = r#"{"end":{"sum_received":{"bits_per_second":4570000.0}}}"#;
        let mbps = parse_iperf3_mbps(json).unwrap();
        assert!((mbps - 4.57).abs() < 1e-9);
    }

    #[test]
    fn iperf3_parse_failure_is_typed() {
        assert!(matches!(
            parse_iperf3_mbps("not json"),
            Err(ExecError::ParseFailed { .. })
        ));
    }

    #[tokio::test]
    async fn probe_combines_latency_and_throughput() {
        let runner = Arc::new(RecordingRunner::new());
        runner.push_output(CommandOutput::with_stdout(PING_OUTPUT));
        runner.push_output(CommandOutput::with_stdout(
            r#"{"end":{"sum_received":{"bits_per_second":3656000.0}}}"#,
        ));
        let prober = Prober::new(runner);
        let result = prober
            .probe("10.0.1.2".parse().unwrap(), 5201, 5)
            .await
            .unwrap();
        assert!((result.throughput_mbps - 3.656).abs() < 1e-9);
        assert!((result.latency.avg_ms - 16.12).abs() < 1e-9);
    }
}
