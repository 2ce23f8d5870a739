//! Client seam toward the transport-network manager.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use mano_core::slice::SliceTransportSpec;
use mano_core::{ManoError, Result};
use mano_transport::manager::{SliceSummary, TransportManager};

#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn rollout(&self, spec: SliceTransportSpec) -> Result<SliceSummary>;
    async fn teardown(&self, slice_id: &str) -> Result<()>;
}

/// In-process transport manager, used by the single-binary deployment and
/// tests.
pub struct InProcessTransport {
    manager: Arc<TransportManager>,
}

impl InProcessTransport {
    pub fn new(manager: Arc<TransportManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TransportClient for InProcessTransport {
    async fn rollout(&self, spec: SliceTransportSpec) -> Result<SliceSummary> {
        self.manager.rollout(spec).await
    }

    async fn teardown(&self, slice_id: &str) -> Result<()> {
        self.manager.teardown(slice_id).await
    }
}

/// Remote transport manager over its HTTP surface.
pub struct HttpTransportClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransportClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ManoError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TransportClient for HttpTransportClient {
    async fn rollout(&self, spec: SliceTransportSpec) -> Result<SliceSummary> {
        let response = self
            .http
            .post(format!("{}/slices", self.base_url))
            .json(&spec)
            .send()
            .await
            .map_err(|e| ManoError::Transient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ManoError::External {
                service: "transport-manager".to_string(),
                message: format!("{status}: {body}"),
            });
        }
        response.json().await.map_err(|e| ManoError::External {
            service: "transport-manager".to_string(),
            message: format!("malformed slice summary: {e}"),
        })
    }

    async fn teardown(&self, slice_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/slices/{slice_id}", self.base_url))
            .send()
            .await
            .map_err(|e| ManoError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ManoError::External {
                service: "transport-manager".to_string(),
                message: status.to_string(),
            })
        }
    }
}
