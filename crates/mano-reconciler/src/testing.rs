//! Test doubles for the external collaborator seams.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use mano_core::types::VnfResource;
use mano_core::{ManoError, Result};
use mano_package::client::PackageBuilder;
use mano_package::deploy::{DeploymentClient, DeploymentStatus};
use mano_package::model::Package;
use mano_package::translate::PackageTranslator;

/// In-memory [`PackageBuilder`] with scriptable push outcomes.
pub struct FakePackageBuilder {
    translator: PackageTranslator,
    push_outcomes: Mutex<VecDeque<Result<String>>>,
    pub push_calls: AtomicU32,
    pub deleted_revisions: Mutex<Vec<String>>,
}

impl Default for FakePackageBuilder {
    fn default() -> Self {
        Self {
            translator: PackageTranslator::default(),
            push_outcomes: Mutex::new(VecDeque::new()),
            push_calls: AtomicU32::new(0),
            deleted_revisions: Mutex::new(Vec::new()),
        }
    }
}

impl FakePackageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_push(&self, outcome: Result<String>) {
        self.push_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_call_count(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted_revisions.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageBuilder for FakePackageBuilder {
    async fn translate(&self, vnf: &VnfResource) -> Result<Package> {
        self.translator.translate(vnf)
    }

    async fn push(&self, _package: &Package) -> Result<String> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        match self.push_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("rev-{}", self.push_calls.load(Ordering::SeqCst))),
        }
    }

    async fn delete(&self, revision: &str) -> Result<()> {
        self.deleted_revisions
            .lock()
            .unwrap()
            .push(revision.to_string());
        Ok(())
    }
}

/// In-memory [`DeploymentClient`] with scriptable status reports.
pub struct FakeDeploymentClient {
    create_outcomes: Mutex<VecDeque<Result<String>>>,
    status_outcomes: Mutex<VecDeque<Result<DeploymentStatus>>>,
    pub create_calls: AtomicU32,
    pub deleted_deployments: Mutex<Vec<String>>,
}

impl Default for FakeDeploymentClient {
    fn default() -> Self {
        Self {
            create_outcomes: Mutex::new(VecDeque::new()),
            status_outcomes: Mutex::new(VecDeque::new()),
            create_calls: AtomicU32::new(0),
            deleted_deployments: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDeploymentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_create(&self, outcome: Result<String>) {
        self.create_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn script_status(&self, outcome: Result<DeploymentStatus>) {
        self.status_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted_deployments.lock().unwrap().clone()
    }

    pub fn create_call_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentClient for FakeDeploymentClient {
    async fn create_deployment(&self, vnf: &VnfResource) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        match self.create_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("dep-{}", vnf.metadata.name)),
        }
    }

    async fn get_deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus> {
        match self.status_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None if deployment_id.is_empty() => {
                Err(ManoError::not_found("deployment", deployment_id))
            }
            None => Ok(DeploymentStatus::Running),
        }
    }

    async fn delete_deployment(&self, deployment_id: &str) -> Result<()> {
        self.deleted_deployments
            .lock()
            .unwrap()
            .push(deployment_id.to_string());
        Ok(())
    }
}
