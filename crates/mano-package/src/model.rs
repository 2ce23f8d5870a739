//! Package model.
//!
//! A package is the unit the external deployment-management service consumes:
//! a manifest, the rendered declarative resources, a function pipeline and a
//! set of validation rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Domain annotations carried on every rendered resource.
pub mod annotation {
    pub const VNF_TYPE: &str = "mano.oran.io/vnf-type";
    pub const CLOUD_TYPE: &str = "mano.oran.io/cloud-type";
    pub const QOS_BANDWIDTH: &str = "mano.oran.io/qos-bandwidth-mbps";
    pub const QOS_LATENCY: &str = "mano.oran.io/qos-latency-ms";
    pub const QOS_CLASS: &str = "mano.oran.io/qos-class";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mutator {
    /// Merge labels into every resource's metadata.
    SetLabels(BTreeMap<String, String>),
    /// Merge annotations into every resource's metadata.
    SetAnnotations(BTreeMap<String, String>),
    /// Force namespace on every resource.
    SetNamespace(String),
    /// Ensure every container declares cpu/memory limits.
    EnsureResourceLimits { cpu: String, memory: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Validator {
    /// Workloads must not run as root.
    RequireNonRoot,
    /// Every container must carry resource limits.
    RequireResourceLimits,
    /// Every resource must be annotated with its QoS class.
    RequireQosAnnotation,
}

/// Ordered function pipeline: mutators run first, in declared order, then
/// validators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionPipeline {
    #[serde(default)]
    pub mutators: Vec<Mutator>,
    #[serde(default)]
    pub validators: Vec<Validator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub pipeline: FunctionPipeline,
    /// Resource kinds contained in the package, in render order.
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// A package ready to push: manifest plus rendered resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub manifest: PackageManifest,
    pub resources: Vec<Value>,
}

impl Package {
    pub fn kind_of(resource: &Value) -> Option<&str> {
        resource.get("kind").and_then(Value::as_str)
    }
}

/// Structured failure raised by a pipeline validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} violated at {}: {}",
            self.rule, self.field, self.message
        )
    }
}
