//! Level-triggered VNF reconciliation.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mano_core::sanitize::sanitize_for_log;
use mano_core::types::{condition, reason, ConditionStatus, VnfPhase, VnfResource, VnfType};
use mano_core::{ManoError, Result};
use mano_lifecycle::retry::{retry_mano, RetryPolicy};
use mano_package::client::PackageBuilder;
use mano_package::deploy::{DeploymentClient, DeploymentStatus};

use crate::controller::{ReconcileResult, Reconciler};
use crate::store::VnfStore;

/// Requeue after a successful deployment creation while the workload warms
/// up.
const CREATING_POLL: Duration = Duration::from_secs(20);
/// Requeue after an external status probe could not be completed.
const STATUS_PROBE_RETRY: Duration = Duration::from_secs(60);
/// Failed-phase backoff after a validation rejection: operator action is
/// required, poll slowly.
const VALIDATION_FAILURE_BACKOFF: Duration = Duration::from_secs(300);
/// Failed-phase backoff after deployment-side failures.
const DEPLOYMENT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);
/// Cleanup budget during finalization; on overrun the finalizer stays put.
const FINALIZE_GRACE: Duration = Duration::from_secs(30);
/// Requeue when finalization ran out of its grace budget.
const FINALIZE_RETRY: Duration = Duration::from_secs(10);

pub struct VnfReconciler {
    store: Arc<dyn VnfStore>,
    packages: Arc<dyn PackageBuilder>,
    deployments: Arc<dyn DeploymentClient>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
}

impl VnfReconciler {
    pub fn new(
        store: Arc<dyn VnfStore>,
        packages: Arc<dyn PackageBuilder>,
        deployments: Arc<dyn DeploymentClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            packages,
            deployments,
            retry_policy: RetryPolicy::default(),
            cancel,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn handle_pending(&self, mut vnf: VnfResource) -> Result<ReconcileResult> {
        let generation = vnf.metadata.generation;
        vnf.status.observed_generation = generation;

        if let Err(err) = vnf.spec.validate() {
            tracing::warn!(key = %vnf.key(), error = %err, "spec validation rejected");
            return self
                .fail(
                    vnf,
                    condition::VALIDATED,
                    reason::VALIDATION_FAILED,
                    &err.to_string(),
                    VALIDATION_FAILURE_BACKOFF,
                )
                .await;
        }
        vnf.status.set_condition(
            condition::VALIDATED,
            ConditionStatus::True,
            "SpecValid",
            "spec accepted",
            generation,
        );

        let package = match self.packages.translate(&vnf).await {
            Ok(package) => package,
            Err(err) => {
                return self
                    .fail(
                        vnf,
                        condition::PACKAGE_CREATED,
                        reason::TRANSLATION_FAILED,
                        &err.to_string(),
                        DEPLOYMENT_FAILURE_BACKOFF,
                    )
                    .await;
            }
        };

        let revision = match retry_mano(&self.retry_policy, &self.cancel, || {
            self.packages.push(&package)
        })
        .await
        {
            Ok(revision) => revision,
            Err(ManoError::Cancelled) => return Err(ManoError::Cancelled),
            Err(err) if err.is_fatal() || matches!(err, ManoError::External { .. }) => {
                return self
                    .fail(
                        vnf,
                        condition::PACKAGE_CREATED,
                        reason::PACKAGE_PUSH_FAILED,
                        &err.to_string(),
                        DEPLOYMENT_FAILURE_BACKOFF,
                    )
                    .await;
            }
            Err(err) => {
                // transient exhaustion or infrastructure: record and let the
                // controller requeue with backoff
                vnf.status.set_condition(
                    condition::PACKAGE_CREATED,
                    ConditionStatus::False,
                    reason::PACKAGE_PUSH_FAILED,
                    &sanitize_for_log(&err.to_string()),
                    generation,
                );
                self.store.update_status(&vnf).await?;
                return Err(err);
            }
        };

        vnf.status.phase = Some(VnfPhase::Creating);
        vnf.status.package_revision = Some(revision.clone());
        vnf.status.set_condition(
            condition::PACKAGE_CREATED,
            ConditionStatus::True,
            reason::PACKAGE_CREATED,
            &format!("pushed package revision {revision}"),
            generation,
        );
        self.store.update_status(&vnf).await?;
        tracing::info!(key = %vnf.key(), %revision, "package pushed, moving to Creating");
        Ok(ReconcileResult::requeue_now())
    }

    async fn handle_creating(&self, mut vnf: VnfResource) -> Result<ReconcileResult> {
        let generation = vnf.metadata.generation;
        match self.deployments.create_deployment(&vnf).await {
            Ok(deployment_id) => {
                vnf.status.phase = Some(VnfPhase::Running);
                vnf.status.deployment_id = Some(deployment_id.clone());
                vnf.status.deployed_clusters = vnf.spec.target_clusters.clone();
                vnf.status.observed_generation = generation;
                vnf.status.set_condition(
                    condition::DEPLOYED,
                    ConditionStatus::True,
                    reason::DEPLOYED,
                    &format!("deployment {deployment_id} created"),
                    generation,
                );
                self.store.update_status(&vnf).await?;
                tracing::info!(key = %vnf.key(), %deployment_id, "deployment created, moving to Running");
                Ok(ReconcileResult::after(CREATING_POLL))
            }
            Err(err) if err.is_fatal() || matches!(err, ManoError::External { .. }) => {
                self.fail(
                    vnf,
                    condition::DEPLOYED,
                    reason::DEPLOYMENT_CREATE_FAILED,
                    &err.to_string(),
                    DEPLOYMENT_FAILURE_BACKOFF,
                )
                .await
            }
            Err(err) => {
                vnf.status.set_condition(
                    condition::DEPLOYED,
                    ConditionStatus::False,
                    reason::DEPLOYMENT_CREATE_FAILED,
                    &sanitize_for_log(&err.to_string()),
                    generation,
                );
                self.store.update_status(&vnf).await?;
                Err(err)
            }
        }
    }

    async fn handle_running(&self, mut vnf: VnfResource) -> Result<ReconcileResult> {
        let generation = vnf.metadata.generation;
        let Some(deployment_id) = vnf.status.deployment_id.clone() else {
            // the deployment identifier was lost; recreate it
            vnf.status.phase = Some(VnfPhase::Creating);
            self.store.update_status(&vnf).await?;
            return Ok(ReconcileResult::requeue_now());
        };

        match self.deployments.get_deployment_status(&deployment_id).await {
            Ok(DeploymentStatus::Failed) => {
                self.fail(
                    vnf,
                    condition::READY,
                    reason::DEPLOYMENT_FAILED,
                    "external deployment reports failure",
                    DEPLOYMENT_FAILURE_BACKOFF,
                )
                .await
            }
            Ok(DeploymentStatus::Deleted) => {
                self.fail(
                    vnf,
                    condition::READY,
                    reason::DEPLOYMENT_FAILED,
                    "external deployment was deleted out of band",
                    DEPLOYMENT_FAILURE_BACKOFF,
                )
                .await
            }
            Ok(_) => {
                // healthy or unchanged: the only status mutation is the
                // reconcile timestamp
                vnf.status.last_reconcile_time = Some(Utc::now());
                self.store.update_status(&vnf).await?;
                Ok(ReconcileResult::after(adaptive_requeue(&vnf)))
            }
            Err(err) => {
                vnf.status.set_condition(
                    condition::READY,
                    ConditionStatus::Unknown,
                    reason::EXTERNAL_STATUS_FAILED,
                    &sanitize_for_log(&err.to_string()),
                    generation,
                );
                vnf.status.last_reconcile_time = Some(Utc::now());
                self.store.update_status(&vnf).await?;
                tracing::warn!(key = %vnf.key(), error = %err, "deployment status probe failed");
                Ok(ReconcileResult::after(STATUS_PROBE_RETRY))
            }
        }
    }

    async fn handle_failed(&self, mut vnf: VnfResource) -> Result<ReconcileResult> {
        if vnf.metadata.generation != vnf.status.observed_generation {
            // the spec changed since the failure: start over
            vnf.status.phase = Some(VnfPhase::Pending);
            vnf.status.observed_generation = vnf.metadata.generation;
            self.store.update_status(&vnf).await?;
            tracing::info!(key = %vnf.key(), "spec updated after failure, resetting to Pending");
            return Ok(ReconcileResult::requeue_now());
        }

        let validation_failed = vnf
            .status
            .conditions
            .iter()
            .any(|c| c.reason == reason::VALIDATION_FAILED && c.status == ConditionStatus::False);
        let backoff = if validation_failed {
            VALIDATION_FAILURE_BACKOFF
        } else {
            DEPLOYMENT_FAILURE_BACKOFF
        };
        Ok(ReconcileResult::after(backoff))
    }

    /// Finalizer flow. External deletions run in parallel; their errors are
    /// logged and combined but never block finalizer removal. Only exceeding
    /// the grace budget leaves the finalizer for a later retry.
    async fn finalize(&self, mut vnf: VnfResource) -> Result<ReconcileResult> {
        if !vnf.has_finalizer() {
            return Ok(ReconcileResult::done());
        }

        if vnf.status.phase != Some(VnfPhase::Deleting) {
            vnf.status.phase = Some(VnfPhase::Deleting);
            self.store.update_status(&vnf).await?;
        }

        let deployment_id = vnf.status.deployment_id.clone();
        let package_revision = vnf.status.package_revision.clone();
        let cleanup = async {
            let delete_deployment = async {
                match &deployment_id {
                    Some(id) => self.deployments.delete_deployment(id).await,
                    None => Ok(()),
                }
            };
            let delete_package = async {
                match &package_revision {
                    Some(revision) => self.packages.delete(revision).await,
                    None => Ok(()),
                }
            };
            tokio::join!(delete_deployment, delete_package)
        };

        match tokio::time::timeout(FINALIZE_GRACE, cleanup).await {
            Ok((deployment_result, package_result)) => {
                if let Err(err) = deployment_result {
                    tracing::warn!(key = %vnf.key(), error = %err, "deployment cleanup failed; proceeding");
                }
                if let Err(err) = package_result {
                    tracing::warn!(key = %vnf.key(), error = %err, "package cleanup failed; proceeding");
                }
            }
            Err(_) => {
                tracing::warn!(key = %vnf.key(), "finalization exceeded grace period; keeping finalizer");
                return Ok(ReconcileResult::after(FINALIZE_RETRY));
            }
        }

        vnf.remove_finalizer();
        self.store.update_metadata(&vnf).await?;
        tracing::info!(key = %vnf.key(), "finalizer removed");
        Ok(ReconcileResult::done())
    }

    /// Common failure path: phase=Failed, a False condition with a stable
    /// reason, one status write, bounded requeue.
    async fn fail(
        &self,
        mut vnf: VnfResource,
        condition_type: &str,
        failure_reason: &str,
        message: &str,
        backoff: Duration,
    ) -> Result<ReconcileResult> {
        let generation = vnf.metadata.generation;
        vnf.status.phase = Some(VnfPhase::Failed);
        vnf.status.observed_generation = generation;
        vnf.status.set_condition(
            condition_type,
            ConditionStatus::False,
            failure_reason,
            &sanitize_for_log(message),
            generation,
        );
        self.store.update_status(&vnf).await?;
        Ok(ReconcileResult::after(backoff))
    }
}

/// Running-phase poll interval, adapted from VNF type and QoS: RAN and
/// low-latency workloads are watched closely, stable standard workloads half
/// as often.
fn adaptive_requeue(vnf: &VnfResource) -> Duration {
    let critical = vnf.spec.vnf_type == VnfType::Ran || vnf.spec.qos.is_low_latency();
    if critical {
        return Duration::from_secs(60);
    }
    let stable = vnf
        .status
        .conditions
        .iter()
        .all(|c| c.status != ConditionStatus::False);
    if stable {
        Duration::from_secs(240)
    } else {
        Duration::from_secs(120)
    }
}

#[async_trait]
impl Reconciler for VnfReconciler {
    async fn reconcile(&self, key: &str) -> Result<ReconcileResult> {
        let (namespace, name) = key
            .split_once('/')
            .ok_or_else(|| ManoError::Internal(format!("malformed key {key:?}")))?;

        let Some(mut vnf) = self.store.get(namespace, name).await? else {
            // already gone; nothing to do
            return Ok(ReconcileResult::done());
        };

        if vnf.is_deleting() {
            return self.finalize(vnf).await;
        }

        if vnf.add_finalizer() {
            self.store.update_metadata(&vnf).await?;
            return Ok(ReconcileResult::requeue_now());
        }

        match vnf.status.phase {
            None => {
                vnf.status.phase = Some(VnfPhase::Pending);
                vnf.status.observed_generation = vnf.metadata.generation;
                self.store.update_status(&vnf).await?;
                Ok(ReconcileResult::requeue_now())
            }
            Some(VnfPhase::Pending) => self.handle_pending(vnf).await,
            Some(VnfPhase::Creating) => self.handle_creating(vnf).await,
            Some(VnfPhase::Running) => self.handle_running(vnf).await,
            Some(VnfPhase::Failed) => self.handle_failed(vnf).await,
            Some(VnfPhase::Deleting) => Ok(ReconcileResult::done()),
        }
    }
}
