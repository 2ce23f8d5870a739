//! GitOps package repository client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use mano_core::types::VnfResource;
use mano_core::{ManoError, Result};
use mano_lifecycle::retry::{retry_mano, RetryPolicy};

use crate::model::Package;
use crate::translate::PackageTranslator;

/// Seam the reconciler depends on: translate a VNF into a package and manage
/// its revisions in the external repository.
#[async_trait]
pub trait PackageBuilder: Send + Sync {
    async fn translate(&self, vnf: &VnfResource) -> Result<Package>;
    async fn push(&self, package: &Package) -> Result<String>;
    async fn delete(&self, revision: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RevisionResponse {
    revision: String,
}

/// Map a transport-level failure into the platform taxonomy.
pub(crate) fn classify_transport_error(err: reqwest::Error) -> ManoError {
    if err.is_timeout() {
        ManoError::Transient(format!("request timed out: {err}"))
    } else if err.is_connect() {
        ManoError::Transient(format!("connection failed: {err}"))
    } else {
        ManoError::Infrastructure(err.to_string())
    }
}

pub(crate) fn classify_status(service: &str, status: StatusCode, body: String) -> ManoError {
    if status.is_server_error() {
        ManoError::Transient(format!("{service} returned {status}: {body}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ManoError::Infrastructure(format!("{service} rejected credentials ({status})"))
    } else {
        ManoError::External {
            service: service.to_string(),
            message: format!("{status}: {body}"),
        }
    }
}

pub struct PackageRepoClient {
    http: reqwest::Client,
    base_url: Url,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PackageRepoClient {
    pub fn new(base_url: &str, token: &str, cancel: CancellationToken) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ManoError::Configuration("invalid repository token".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .default_headers(headers)
            .build()
            .map_err(|e| ManoError::Configuration(e.to_string()))?;

        let base_url = Url::parse(base_url)
            .map_err(|e| ManoError::Configuration(format!("invalid repository url: {e}")))?;

        Ok(Self {
            http,
            base_url,
            retry_policy: RetryPolicy::default(),
            cancel,
        })
    }

    /// Repository coordinates from the environment:
    /// `MANO_PACKAGE_REPO_URL` and `MANO_PACKAGE_REPO_TOKEN`.
    pub fn from_env(cancel: CancellationToken) -> Result<Self> {
        let url = std::env::var("MANO_PACKAGE_REPO_URL")
            .map_err(|_| ManoError::Configuration("MANO_PACKAGE_REPO_URL is not set".into()))?;
        let token = std::env::var("MANO_PACKAGE_REPO_TOKEN").unwrap_or_default();
        Self::new(&url, &token, cancel)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn push_once(&self, package: &Package) -> Result<String> {
        let url = self
            .base_url
            .join("packages")
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let response = self
            .http
            .post(url)
            .json(package)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            let parsed: RevisionResponse = response
                .json()
                .await
                .map_err(|e| ManoError::External {
                    service: "package-repository".to_string(),
                    message: format!("malformed revision response: {e}"),
                })?;
            Ok(parsed.revision)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status("package-repository", status, body))
        }
    }

    async fn delete_once(&self, revision: &str) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("packages/{revision}"))
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        // deleting an already-gone revision is success
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status("package-repository", status, body))
        }
    }

    /// Push a package, retrying transient failures, and return the revision
    /// identifier minted by the repository.
    pub async fn push(&self, package: &Package) -> Result<String> {
        let revision = retry_mano(&self.retry_policy, &self.cancel, || {
            self.push_once(package)
        })
        .await?;
        tracing::info!(package = %package.manifest.name, %revision, "package revision pushed");
        Ok(revision)
    }

    pub async fn delete(&self, revision: &str) -> Result<()> {
        retry_mano(&self.retry_policy, &self.cancel, || {
            self.delete_once(revision)
        })
        .await?;
        tracing::info!(%revision, "package revision deleted");
        Ok(())
    }

    pub async fn get(&self, revision: &str) -> Result<Package> {
        let url = self
            .base_url
            .join(&format!("packages/{revision}"))
            .map_err(|e| ManoError::Internal(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ManoError::not_found("package-revision", revision));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("package-repository", status, body));
        }
        response.json().await.map_err(|e| ManoError::External {
            service: "package-repository".to_string(),
            message: format!("malformed package body: {e}"),
        })
    }
}

/// Production [`PackageBuilder`]: in-memory translation plus the repository
/// client.
pub struct GitopsPackageBuilder {
    translator: PackageTranslator,
    repo: PackageRepoClient,
}

impl GitopsPackageBuilder {
    pub fn new(translator: PackageTranslator, repo: PackageRepoClient) -> Self {
        Self { translator, repo }
    }
}

#[async_trait]
impl PackageBuilder for GitopsPackageBuilder {
    async fn translate(&self, vnf: &VnfResource) -> Result<Package> {
        self.translator.translate(vnf)
    }

    async fn push(&self, package: &Package) -> Result<String> {
        self.repo.push(package).await
    }

    async fn delete(&self, revision: &str) -> Result<()> {
        self.repo.delete(revision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_follows_the_taxonomy() {
        let err = classify_status("package-repository", StatusCode::BAD_GATEWAY, "oops".into());
        assert!(err.is_retryable());

        let err = classify_status("package-repository", StatusCode::UNAUTHORIZED, "".into());
        assert!(matches!(err, ManoError::Infrastructure(_)));
        // auth failures retry forever at the reconcile level, not per-call
        assert!(!err.is_fatal());

        let err = classify_status("package-repository", StatusCode::UNPROCESSABLE_ENTITY, "bad".into());
        assert!(matches!(err, ManoError::External { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn client_construction_validates_configuration() {
        let cancel = CancellationToken::new();
        assert!(PackageRepoClient::new("http://repo.local:7007/", "token", cancel.clone()).is_ok());
        assert!(PackageRepoClient::new("not a url", "token", cancel.clone()).is_err());
        assert!(PackageRepoClient::new("http://repo.local", "bad\ntoken", cancel).is_err());
    }
}
