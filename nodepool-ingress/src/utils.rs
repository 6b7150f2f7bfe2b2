use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{ResourceExt, api::DynamicObject};
use serde_json::{Map, Value, json};

use crate::errors::AddonError;

/// Changes applied to a rendered or fetched object before it is written.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Overrides {
    pub replicas: Option<i32>,
    pub image: Option<String>,
    /// `Some(vec![])` removes all external IPs, `None` leaves them untouched.
    pub external_ips: Option<Vec<String>>,
    pub owner_references: Vec<OwnerReference>,
}

impl Overrides {
    pub(crate) fn apply(&self, obj: &mut DynamicObject) -> Result<(), AddonError> {
        if let Some(replicas) = self.replicas {
            set_replicas(obj, replicas)?;
        }
        if let Some(image) = &self.image {
            set_image(obj, image)?;
        }
        if let Some(ips) = &self.external_ips {
            set_external_ips(obj, ips)?;
        }
        if !self.owner_references.is_empty() {
            obj.metadata.owner_references = Some(self.owner_references.clone());
        }
        Ok(())
    }
}

/// `Kind namespace/name` for log messages.
pub(crate) fn display_name(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    match obj.namespace() {
        Some(ns) => format!("{} {}/{}", kind, ns, obj.name_any()),
        None => format!("{} {}", kind, obj.name_any()),
    }
}

pub(crate) fn add_labels(obj: &mut DynamicObject, labels: &BTreeMap<String, String>) {
    obj.labels_mut()
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn field_mut<'a>(
    obj: &'a mut DynamicObject,
    path: &[&str],
) -> Result<&'a mut Map<String, Value>, AddonError> {
    let name = display_name(obj);
    let mut current = &mut obj.data;
    for segment in path {
        current = current
            .as_object_mut()
            .and_then(|m| m.get_mut(*segment))
            .ok_or_else(|| {
                AddonError::LookupFailure(format!("{} has no field {}", name, path.join(".")))
            })?;
    }
    let joined = path.join(".");
    current
        .as_object_mut()
        .ok_or_else(|| AddonError::LookupFailure(format!("{} field {} is not an object", name, joined)))
}

#[cfg(test)]
fn field<'a>(obj: &'a DynamicObject, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(&obj.data, |current, segment| current.get(*segment))
}

pub(crate) fn set_replicas(obj: &mut DynamicObject, replicas: i32) -> Result<(), AddonError> {
    field_mut(obj, &["spec"])?.insert("replicas".to_string(), json!(replicas));
    Ok(())
}

#[cfg(test)]
pub(crate) fn replicas(obj: &DynamicObject) -> Option<i64> {
    field(obj, &["spec", "replicas"]).and_then(|v| v.as_i64())
}

/// Set the image of all containers of a pod template.
pub(crate) fn set_image(obj: &mut DynamicObject, image: &str) -> Result<(), AddonError> {
    let name = display_name(obj);
    let containers = field_mut(obj, &["spec", "template", "spec"])?
        .get_mut("containers")
        .and_then(|v| v.as_array_mut())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AddonError::LookupFailure(format!("{} has no containers", name)))?;
    for container in containers.iter_mut() {
        if let Some(c) = container.as_object_mut() {
            c.insert("image".to_string(), json!(image));
        }
    }
    Ok(())
}

#[cfg(test)]
/// Images of all containers of a pod template.
pub(crate) fn images(obj: &DynamicObject) -> Vec<String> {
    field(obj, &["spec", "template", "spec", "containers"])
        .and_then(|v| v.as_array())
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c.get("image").and_then(|i| i.as_str()))
                .map(|i| i.to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn set_external_ips(obj: &mut DynamicObject, ips: &[String]) -> Result<(), AddonError> {
    let spec = field_mut(obj, &["spec"])?;
    if ips.is_empty() {
        spec.remove("externalIPs");
    } else {
        spec.insert("externalIPs".to_string(), json!(ips));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn external_ips(obj: &DynamicObject) -> Vec<String> {
    field(obj, &["spec", "externalIPs"])
        .and_then(|v| v.as_array())
        .map(|ips| {
            ips.iter()
                .filter_map(|ip| ip.as_str().map(|v| v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}
