//! VNF spec to package translation.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use mano_core::types::{VnfResource, VnfType};
use mano_core::{ManoError, Result};

use crate::model::{
    annotation, FunctionPipeline, Mutator, Package, PackageManifest, Validator,
};
use crate::render::render_pipeline;

/// Container images per VNF role. Versions come from the VNF spec, falling
/// back to the stable channel.
fn image_for(vnf_type: VnfType, version: &str) -> String {
    let component = match vnf_type {
        VnfType::Ran => "oran-du",
        VnfType::Cn => "core-upf",
        VnfType::TnEdge => "tn-agent",
        VnfType::TnCentral => "tn-manager",
    };
    format!("registry.mano.local/{component}:{version}")
}

/// Translates validated VNF specs into deployable packages.
#[derive(Debug, Clone)]
pub struct PackageTranslator {
    /// Default resource limits stamped onto workloads.
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for PackageTranslator {
    fn default() -> Self {
        Self {
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

impl PackageTranslator {
    /// Produce the package for a VNF in memory: rendered resources, domain
    /// annotations, the function pipeline and its validation rules, already
    /// run to completion.
    pub fn translate(&self, vnf: &VnfResource) -> Result<Package> {
        vnf.spec.validate()?;

        let name = format!("{}-{}", vnf.metadata.namespace, vnf.metadata.name);
        let version = vnf.spec.version.clone().unwrap_or_else(|| "stable".to_string());
        let qos_class = if vnf.spec.qos.is_low_latency() {
            "low-latency"
        } else {
            "standard"
        };

        let mut annotations = BTreeMap::new();
        annotations.insert(
            annotation::VNF_TYPE.to_string(),
            vnf.spec.vnf_type.as_str().to_string(),
        );
        annotations.insert(
            annotation::CLOUD_TYPE.to_string(),
            vnf.spec.placement.cloud_type.as_str().to_string(),
        );
        annotations.insert(
            annotation::QOS_BANDWIDTH.to_string(),
            vnf.spec.qos.bandwidth_mbps.to_string(),
        );
        annotations.insert(
            annotation::QOS_LATENCY.to_string(),
            vnf.spec.qos.latency_ms.to_string(),
        );
        annotations.insert(annotation::QOS_CLASS.to_string(), qos_class.to_string());

        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), vnf.metadata.name.clone());
        labels.insert("app.kubernetes.io/managed-by".to_string(), "mano".to_string());
        labels.insert(
            "mano.oran.io/site".to_string(),
            vnf.spec.placement.site.clone(),
        );

        let pipeline = FunctionPipeline {
            mutators: vec![
                Mutator::SetNamespace(vnf.metadata.namespace.clone()),
                Mutator::SetLabels(labels),
                Mutator::SetAnnotations(annotations),
                Mutator::EnsureResourceLimits {
                    cpu: self.cpu_limit.clone(),
                    memory: self.memory_limit.clone(),
                },
            ],
            validators: vec![
                Validator::RequireNonRoot,
                Validator::RequireResourceLimits,
                Validator::RequireQosAnnotation,
            ],
        };

        let resources = vec![
            self.deployment(vnf, &version),
            self.service(vnf),
            self.config_map(vnf),
            self.network_policy(vnf),
        ];

        let manifest = PackageManifest {
            name,
            version,
            pipeline: pipeline.clone(),
            inventory: resources
                .iter()
                .filter_map(|r| Package::kind_of(r).map(str::to_string))
                .collect(),
            upstream: None,
            dependencies: Vec::new(),
        };

        let mut package = Package {
            manifest,
            resources,
        };
        render_pipeline(&mut package).map_err(|failure| {
            ManoError::Validation(format!("package validation failed: {failure}"))
        })?;
        Ok(package)
    }

    fn deployment(&self, vnf: &VnfResource, version: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": vnf.metadata.name,
            },
            "spec": {
                "replicas": 1,
                "selector": {
                    "matchLabels": { "app.kubernetes.io/name": vnf.metadata.name }
                },
                "template": {
                    "metadata": {
                        "labels": { "app.kubernetes.io/name": vnf.metadata.name }
                    },
                    "spec": {
                        "securityContext": {
                            "runAsNonRoot": true,
                            "runAsUser": 10001
                        },
                        "containers": [{
                            "name": vnf.spec.vnf_type.as_str().to_lowercase(),
                            "image": image_for(vnf.spec.vnf_type, version),
                            "ports": [{ "containerPort": 8080, "name": "data" }],
                            "resources": {}
                        }]
                    }
                }
            }
        })
    }

    fn service(&self, vnf: &VnfResource) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": vnf.metadata.name },
            "spec": {
                "selector": { "app.kubernetes.io/name": vnf.metadata.name },
                "ports": [{ "port": 8080, "targetPort": "data", "protocol": "TCP" }]
            }
        })
    }

    fn config_map(&self, vnf: &VnfResource) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": format!("{}-qos", vnf.metadata.name) },
            "data": {
                "bandwidth_mbps": vnf.spec.qos.bandwidth_mbps.to_string(),
                "latency_ms": vnf.spec.qos.latency_ms.to_string(),
                "target_clusters": vnf.spec.target_clusters.join(","),
            }
        })
    }

    fn network_policy(&self, vnf: &VnfResource) -> Value {
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": { "name": format!("{}-isolation", vnf.metadata.name) },
            "spec": {
                "podSelector": {
                    "matchLabels": { "app.kubernetes.io/name": vnf.metadata.name }
                },
                "policyTypes": ["Ingress"],
                "ingress": [{
                    "from": [{
                        "podSelector": {
                            "matchLabels": { "app.kubernetes.io/managed-by": "mano" }
                        }
                    }]
                }]
            }
        })
    }
}
