//! Deployment-management service client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use url::Url;

use mano_core::types::VnfResource;
use mano_core::{ManoError, Result};

use crate::client::{classify_status, classify_transport_error};

/// Statuses the control plane recognizes from the external service. Anything
/// else is reported as `Unchanged` and leaves the VNF phase alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    Running,
    Failed,
    Deleted,
    Unchanged,
}

impl DeploymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => DeploymentStatus::Pending,
            "Running" => DeploymentStatus::Running,
            "Failed" => DeploymentStatus::Failed,
            "Deleted" => DeploymentStatus::Deleted,
            _ => DeploymentStatus::Unchanged,
        }
    }
}

/// Seam the reconciler depends on for workload lifecycle in the external
/// deployment-management service.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    async fn create_deployment(&self, vnf: &VnfResource) -> Result<String>;
    async fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus>;
    async fn delete_deployment(&self, deployment_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

pub struct DeploymentServiceClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DeploymentServiceClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ManoError::Configuration("invalid deployment-service token".to_string())
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| ManoError::Configuration(e.to_string()))?;
        let base_url = Url::parse(base_url).map_err(|e| {
            ManoError::Configuration(format!("invalid deployment-service url: {e}"))
        })?;
        Ok(Self { http, base_url })
    }

    /// Coordinates from `MANO_DEPLOY_SERVICE_URL` / `MANO_DEPLOY_SERVICE_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("MANO_DEPLOY_SERVICE_URL")
            .map_err(|_| ManoError::Configuration("MANO_DEPLOY_SERVICE_URL is not set".into()))?;
        let token = std::env::var("MANO_DEPLOY_SERVICE_TOKEN").unwrap_or_default();
        Self::new(&url, &token)
    }
}

#[async_trait]
impl DeploymentClient for DeploymentServiceClient {
    async fn create_deployment(&self, vnf: &VnfResource) -> Result<String> {
        let url = self
            .base_url
            .join("deployments")
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let body = json!({
            "name": vnf.metadata.name,
            "namespace": vnf.metadata.namespace,
            "vnf_type": vnf.spec.vnf_type,
            "package_revision": vnf.status.package_revision,
            "target_clusters": vnf.spec.target_clusters,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            let parsed: CreateResponse = response.json().await.map_err(|e| ManoError::External {
                service: "deployment-management".to_string(),
                message: format!("malformed create response: {e}"),
            })?;
            Ok(parsed.id)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status("deployment-management", status, body))
        }
    }

    async fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus> {
        let url = self
            .base_url
            .join(&format!("deployments/{deployment_id}/status"))
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ManoError::not_found("deployment", deployment_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("deployment-management", status, body));
        }
        let parsed: StatusResponse = response.json().await.map_err(|e| ManoError::External {
            service: "deployment-management".to_string(),
            message: format!("malformed status response: {e}"),
        })?;
        Ok(DeploymentStatus::parse(&parsed.status))
    }

    async fn delete_deployment(&self, deployment_id: &str) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("deployments/{deployment_id}"))
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        // repeated deletion of an already-gone deployment is success
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status("deployment-management", status, body))
        }
    }
}
