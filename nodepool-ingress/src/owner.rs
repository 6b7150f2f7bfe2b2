use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{ResourceExt, api::DynamicObject};
use nodepool_ingress_templates::AddonKind;

use crate::store::ObjectStore;

/// The object managing the addon. Cluster-shared addon objects are owned by it,
/// so they are garbage collected once the manager is removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ManagerIdentity {
    pub kind: AddonKind,
    pub name: String,
}

impl ManagerIdentity {
    pub(crate) fn cluster_role(name: &str) -> Self {
        Self {
            kind: AddonKind::ClusterRole,
            name: name.to_string(),
        }
    }
}

/// Build the controlling owner reference pointing to `manager`.
///
/// Without a manager object all identifying fields are left empty, which still
/// yields a reference (flagged as controller) rather than none at all.
pub(crate) fn owner_reference(
    identity: &ManagerIdentity,
    manager: Option<&DynamicObject>,
) -> OwnerReference {
    match manager {
        Some(obj) => {
            let (api_version, kind) = match &obj.types {
                Some(t) => (t.api_version.clone(), t.kind.clone()),
                None => (
                    identity.kind.gvk().api_version(),
                    identity.kind.as_str().to_string(),
                ),
            };
            OwnerReference {
                api_version,
                kind,
                name: obj.name_any(),
                uid: obj.uid().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }
        }
        None => OwnerReference {
            controller: Some(true),
            block_owner_deletion: Some(true),
            ..Default::default()
        },
    }
}

/// Whether `owner` carries no identity, i.e. the manager was not found when it was resolved.
pub(crate) fn is_unresolved(owner: &OwnerReference) -> bool {
    owner.uid.is_empty()
}

/// Look up the manager object and build an owner reference for it.
///
/// A failed lookup is not an error: the manager may not exist yet on first
/// install, in which case a zero-valued reference is returned.
pub(crate) async fn resolve<S>(store: &S, identity: &ManagerIdentity) -> OwnerReference
where
    S: ObjectStore + ?Sized,
{
    match store.get(identity.kind, None, identity.name.as_str()).await {
        Ok(obj) => owner_reference(identity, Some(&obj)),
        Err(e) => {
            debug!(
                "failed to get manager {} {}, cluster-shared objects won't be garbage collected with it: {}",
                identity.kind, identity.name, e
            );
            owner_reference(identity, None)
        }
    }
}
