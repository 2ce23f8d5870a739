//! VNF custom resource model.
//!
//! The resource is persisted by the hosting cluster's API; this module only
//! defines the shape the control plane reconciles plus the validation and
//! condition bookkeeping shared by the reconciler and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{ManoError, Result};

/// QoS bandwidth bounds in Mbps, inclusive.
pub const QOS_BANDWIDTH_RANGE: (f64, f64) = (1.0, 5.0);
/// QoS latency bounds in milliseconds, inclusive.
pub const QOS_LATENCY_RANGE: (f64, f64) = (1.0, 10.0);

/// Finalizer owned by the VNF reconciler.
pub const VNF_FINALIZER: &str = "mano.oran.io/vnf-cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VnfType {
    #[serde(rename = "RAN")]
    Ran,
    #[serde(rename = "CN")]
    Cn,
    #[serde(rename = "TN-edge")]
    TnEdge,
    #[serde(rename = "TN-central")]
    TnCentral,
}

impl VnfType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VnfType::Ran => "RAN",
            VnfType::Cn => "CN",
            VnfType::TnEdge => "TN-edge",
            VnfType::TnCentral => "TN-central",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    Edge,
    Regional,
    Central,
}

impl CloudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::Edge => "edge",
            CloudType::Regional => "regional",
            CloudType::Central => "central",
        }
    }
}

/// Requested QoS envelope for a single VNF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosRequirements {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
}

impl QosRequirements {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = QOS_BANDWIDTH_RANGE;
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps < lo || self.bandwidth_mbps > hi
        {
            return Err(ManoError::Validation(format!(
                "qos bandwidth {} Mbps outside allowed range [{}, {}]",
                self.bandwidth_mbps, lo, hi
            )));
        }
        let (lo, hi) = QOS_LATENCY_RANGE;
        if !self.latency_ms.is_finite() || self.latency_ms < lo || self.latency_ms > hi {
            return Err(ManoError::Validation(format!(
                "qos latency {} ms outside allowed range [{}, {}]",
                self.latency_ms, lo, hi
            )));
        }
        Ok(())
    }

    /// Low-latency workloads get tighter reconcile polling.
    pub fn is_low_latency(&self) -> bool {
        self.latency_ms <= 3.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub cloud_type: CloudType,
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnfSpec {
    #[serde(rename = "type")]
    pub vnf_type: VnfType,
    pub qos: QosRequirements,
    pub placement: Placement,
    pub target_clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl VnfSpec {
    pub fn validate(&self) -> Result<()> {
        self.qos.validate()?;
        if self.placement.site.is_empty() {
            return Err(ManoError::Validation(
                "placement site must not be empty".to_string(),
            ));
        }
        if self.target_clusters.is_empty() {
            return Err(ManoError::Validation(
                "at least one target cluster is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Monotonically increasing counter bumped by the store on spec changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VnfPhase {
    Pending,
    Creating,
    Running,
    Failed,
    Deleting,
}

impl VnfPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VnfPhase::Pending => "Pending",
            VnfPhase::Creating => "Creating",
            VnfPhase::Running => "Running",
            VnfPhase::Failed => "Failed",
            VnfPhase::Deleting => "Deleting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Stable condition reasons surfaced on VNF status.
pub mod reason {
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const TRANSLATION_FAILED: &str = "TranslationFailed";
    pub const PACKAGE_PUSH_FAILED: &str = "PackageRevisionPushFailed";
    pub const PACKAGE_CREATED: &str = "PackageCreated";
    pub const DEPLOYMENT_CREATE_FAILED: &str = "DeploymentCreateFailed";
    pub const DEPLOYED: &str = "Deployed";
    pub const EXTERNAL_STATUS_FAILED: &str = "ExternalStatusFailed";
    pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";
}

/// Well-known condition types.
pub mod condition {
    pub const VALIDATED: &str = "Validated";
    pub const PACKAGE_CREATED: &str = "PackageCreated";
    pub const DEPLOYED: &str = "Deployed";
    pub const READY: &str = "Ready";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnfStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VnfPhase>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployed_clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

impl VnfStatus {
    /// Insert or update a condition, keyed by type. The transition timestamp
    /// only moves when the status value actually changes.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        observed_generation: i64,
    ) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
            return;
        }
        self.conditions.push(Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
            last_transition_time: Utc::now(),
        });
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// A VNF custom resource as observed through the host cluster API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnfResource {
    pub metadata: ObjectMeta,
    pub spec: VnfSpec,
    #[serde(default)]
    pub status: VnfStatus,
}

impl VnfResource {
    pub fn new(namespace: &str, name: &str, spec: VnfSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                generation: 1,
                deletion_timestamp: None,
                finalizers: Vec::new(),
                creation_timestamp: Some(Utc::now()),
            },
            spec,
            status: VnfStatus::default(),
        }
    }

    /// Namespaced key used by the controller workqueue and the result cache.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == VNF_FINALIZER)
    }

    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata.finalizers.push(VNF_FINALIZER.to_string());
        true
    }

    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != VNF_FINALIZER);
        self.metadata.finalizers.len() != before
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Stable fingerprint over the fields a reconcile outcome depends on.
    /// Identical spec inputs always hash to the same value within a process,
    /// which is what the result cache needs.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.metadata.name.hash(&mut hasher);
        self.metadata.generation.hash(&mut hasher);
        self.spec.vnf_type.hash(&mut hasher);
        self.spec.qos.bandwidth_mbps.to_bits().hash(&mut hasher);
        self.spec.qos.latency_ms.to_bits().hash(&mut hasher);
        hasher.finish()
    }
}
