//! Interface bandwidth sampling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use mano_exec::command::CommandRunner;
use mano_exec::tc::TrafficController;

use crate::reconcile::AgentState;

/// Ring-buffer depth of retained samples per node.
const MAX_SAMPLES: usize = 240;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub interface: String,
    pub timestamp: DateTime<Utc>,
    pub rx_bps: f64,
    pub tx_bps: f64,
}

struct LastReading {
    at: Instant,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Periodically reads kernel counters for the configured interfaces and
/// derives bits-per-second from successive readings.
pub struct BandwidthMonitor {
    shaper: TrafficController,
    interfaces: Vec<String>,
    state: Arc<AgentState>,
    export_dir: Option<PathBuf>,
    last: HashMap<String, LastReading>,
}

impl BandwidthMonitor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        interfaces: Vec<String>,
        state: Arc<AgentState>,
        export_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            shaper: TrafficController::new(runner),
            interfaces,
            state,
            export_dir,
            last: HashMap::new(),
        }
    }

    pub async fn sample_once(&mut self) {
        let now = Instant::now();
        let mut fresh = Vec::new();
        for interface in &self.interfaces {
            let stats = match self.shaper.status(interface).await {
                Ok(stats) => stats,
                Err(err) => {
                    tracing::debug!(interface, error = %err, "bandwidth sample skipped");
                    continue;
                }
            };
            if let Some(previous) = self.last.get(interface) {
                let elapsed = now.duration_since(previous.at).as_secs_f64();
                if elapsed > 0.0 {
                    fresh.push(BandwidthSample {
                        interface: interface.clone(),
                        timestamp: Utc::now(),
                        rx_bps: (stats.rx.bytes.saturating_sub(previous.rx_bytes) * 8) as f64
                            / elapsed,
                        tx_bps: (stats.tx.bytes.saturating_sub(previous.tx_bytes) * 8) as f64
                            / elapsed,
                    });
                }
            }
            self.last.insert(
                interface.clone(),
                LastReading {
                    at: now,
                    rx_bytes: stats.rx.bytes,
                    tx_bytes: stats.tx.bytes,
                },
            );
        }

        if fresh.is_empty() {
            return;
        }
        {
            let mut samples = self.state.bandwidth.lock().expect("bandwidth lock poisoned");
            samples.extend(fresh.iter().cloned());
            let excess = samples.len().saturating_sub(MAX_SAMPLES);
            if excess > 0 {
                samples.drain(0..excess);
            }
        }
        if let Some(dir) = &self.export_dir {
            self.export(dir, &fresh);
        }
    }

    fn export(&self, dir: &PathBuf, samples: &[BandwidthSample]) {
        let path = dir.join("bandwidth.json");
        match serde_json::to_vec_pretty(samples) {
            Ok(body) => {
                if let Err(err) = std::fs::write(&path, body) {
                    tracing::warn!(path = %path.display(), error = %err, "bandwidth export failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "bandwidth serialization failed"),
        }
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample_once().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mano_exec::command::{CommandOutput, RecordingRunner};

    fn link_output(rx_bytes: u64, tx_bytes: u64) -> CommandOutput {
        CommandOutput::with_stdout(format!(
            "2: eth0: <BROADCAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP\n    link/ether aa:aa:aa:aa:aa:aa\n    RX: bytes  packets  errors  dropped overrun mcast\n    {rx_bytes}      100      0       0       0       0\n    TX: bytes  packets  errors  dropped carrier collsns\n    {tx_bytes}      50       0       0       0       0"
        ))
    }

    #[tokio::test]
    async fn derives_bps_from_successive_readings() {
        let runner = Arc::new(RecordingRunner::new());
        runner.push_output(link_output(1_000, 500));
        runner.push_output(link_output(2_000, 1_500));

        let state = AgentState::new();
        let mut monitor = BandwidthMonitor::new(
            runner,
            vec!["eth0".to_string()],
            state.clone(),
            None,
        );

        monitor.sample_once().await;
        assert!(state.bandwidth.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.sample_once().await;

        let samples = state.bandwidth.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].rx_bps > 0.0);
        assert!(samples[0].tx_bps > 0.0);
    }
}
