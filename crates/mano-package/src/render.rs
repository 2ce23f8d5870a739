//! Deterministic pipeline rendering.
//!
//! Mutators run in declared order over every resource, then validators run;
//! the first validator failure aborts with a structured error.

use serde_json::{Map, Value};

use crate::model::{annotation, Mutator, Package, ValidationFailure, Validator};

pub fn render_pipeline(package: &mut Package) -> Result<(), ValidationFailure> {
    let pipeline = package.manifest.pipeline.clone();
    for mutator in &pipeline.mutators {
        for resource in &mut package.resources {
            apply_mutator(mutator, resource);
        }
    }
    for validator in &pipeline.validators {
        for resource in &package.resources {
            run_validator(*validator, resource)?;
        }
    }
    Ok(())
}

fn metadata_map<'a>(resource: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    resource
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn containers_mut(resource: &mut Value) -> Option<&mut Vec<Value>> {
    resource
        .pointer_mut("/spec/template/spec/containers")
        .and_then(Value::as_array_mut)
}

fn apply_mutator(mutator: &Mutator, resource: &mut Value) {
    match mutator {
        Mutator::SetNamespace(namespace) => {
            if let Some(metadata) = resource
                .as_object_mut()
                .map(|obj| {
                    obj.entry("metadata")
                        .or_insert_with(|| Value::Object(Map::new()))
                })
                .and_then(Value::as_object_mut)
            {
                metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
            }
        }
        Mutator::SetLabels(labels) => {
            if let Some(map) = metadata_map(resource, "labels") {
                for (key, value) in labels {
                    map.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }
        Mutator::SetAnnotations(annotations) => {
            if let Some(map) = metadata_map(resource, "annotations") {
                for (key, value) in annotations {
                    map.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }
        Mutator::EnsureResourceLimits { cpu, memory } => {
            let Some(containers) = containers_mut(resource) else {
                return;
            };
            for container in containers {
                let limits = container
                    .as_object_mut()
                    .map(|c| {
                        c.entry("resources")
                            .or_insert_with(|| Value::Object(Map::new()))
                    })
                    .and_then(Value::as_object_mut)
                    .map(|r| {
                        r.entry("limits")
                            .or_insert_with(|| Value::Object(Map::new()))
                    })
                    .and_then(Value::as_object_mut);
                if let Some(limits) = limits {
                    limits
                        .entry("cpu")
                        .or_insert_with(|| Value::String(cpu.clone()));
                    limits
                        .entry("memory")
                        .or_insert_with(|| Value::String(memory.clone()));
                }
            }
        }
    }
}

fn run_validator(validator: Validator, resource: &Value) -> Result<(), ValidationFailure> {
    let kind = Package::kind_of(resource).unwrap_or("Unknown");
    match validator {
        Validator::RequireNonRoot => {
            if kind != "Deployment" {
                return Ok(());
            }
            let non_root = resource
                .pointer("/spec/template/spec/securityContext/runAsNonRoot")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if non_root {
                Ok(())
            } else {
                Err(ValidationFailure {
                    field: "spec.template.spec.securityContext.runAsNonRoot".to_string(),
                    rule: "require-non-root".to_string(),
                    message: "workload must not run as root".to_string(),
                })
            }
        }
        Validator::RequireResourceLimits => {
            if kind != "Deployment" {
                return Ok(());
            }
            let containers = resource
                .pointer("/spec/template/spec/containers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for (index, container) in containers.iter().enumerate() {
                let has_limits = container
                    .pointer("/resources/limits/cpu")
                    .and(container.pointer("/resources/limits/memory"))
                    .is_some();
                if !has_limits {
                    return Err(ValidationFailure {
                        field: format!("spec.template.spec.containers[{index}].resources.limits"),
                        rule: "require-resource-limits".to_string(),
                        message: "cpu and memory limits are required".to_string(),
                    });
                }
            }
            Ok(())
        }
        Validator::RequireQosAnnotation => {
            let annotated = resource
                .pointer("/metadata/annotations")
                .and_then(Value::as_object)
                .map(|a| a.contains_key(annotation::QOS_CLASS))
                .unwrap_or(false);
            if annotated {
                Ok(())
            } else {
                Err(ValidationFailure {
                    field: format!("metadata.annotations.{}", annotation::QOS_CLASS),
                    rule: "require-qos-annotation".to_string(),
                    message: format!("{kind} is missing the QoS class annotation"),
                })
            }
        }
    }
}
