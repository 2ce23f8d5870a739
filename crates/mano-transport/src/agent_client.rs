//! HTTP client for node agents.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;

use mano_core::slice::AgentConfig;
use mano_core::{ManoError, Result};

use crate::manager::{AgentClient, AgentStatusView, ProbeOutcome};
use crate::planner::NodeInfo;

#[derive(Debug, Deserialize)]
struct AgentStatusBody {
    applied_slices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeLatency {
    avg_ms: f64,
    #[serde(default)]
    loss_percent: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeBody {
    throughput_mbps: f64,
    latency: ProbeLatency,
}

pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ManoError::Configuration(e.to_string()))?;
        Ok(Self { http })
    }

    fn classify(err: reqwest::Error) -> ManoError {
        if err.is_timeout() || err.is_connect() {
            ManoError::Transient(err.to_string())
        } else {
            ManoError::Infrastructure(err.to_string())
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn apply(&self, node: &NodeInfo, config: &AgentConfig) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/apply", node.agent_url))
            .json(config)
            .send()
            .await
            .map_err(Self::classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ManoError::External {
                service: format!("agent:{}", node.name),
                message: format!("{status}: {body}"),
            })
        }
    }

    async fn status(&self, node: &NodeInfo) -> Result<AgentStatusView> {
        let response = self
            .http
            .get(format!("{}/status", node.agent_url))
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(ManoError::Transient(format!(
                "agent {} status returned {}",
                node.name,
                response.status()
            )));
        }
        let body: AgentStatusBody = response.json().await.map_err(|e| ManoError::External {
            service: format!("agent:{}", node.name),
            message: format!("malformed status body: {e}"),
        })?;
        Ok(AgentStatusView {
            applied_slices: body.applied_slices,
        })
    }

    async fn probe(
        &self,
        node: &NodeInfo,
        peer: IpAddr,
        port: u16,
        duration_secs: u32,
    ) -> Result<ProbeOutcome> {
        let response = self
            .http
            .post(format!("{}/test", node.agent_url))
            .json(&json!({
                "peer": peer,
                "port": port,
                "duration_secs": duration_secs,
            }))
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(ManoError::Transient(format!(
                "agent {} probe returned {}",
                node.name,
                response.status()
            )));
        }
        let body: ProbeBody = response.json().await.map_err(|e| ManoError::External {
            service: format!("agent:{}", node.name),
            message: format!("malformed probe body: {e}"),
        })?;
        Ok(ProbeOutcome {
            // the agent reports ICMP round trips; use them directly
            throughput_mbps: body.throughput_mbps,
            rtt_ms: body.latency.avg_ms,
            loss_percent: body.latency.loss_percent,
        })
    }
}
