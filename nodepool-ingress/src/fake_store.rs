//! In-memory [`ObjectStore`] used by the unit tests.
//!
//! Records every call in order, enforces name uniqueness per kind and namespace,
//! evaluates equality based label selectors and can simulate failures as well as
//! deletions which only complete after a delay.

use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use kube::{
    ResourceExt,
    api::{DynamicObject, ObjectMeta, TypeMeta},
};
use nodepool_ingress_templates::AddonKind;
use tokio::time::{Duration, Instant};

use crate::{
    errors::api_error,
    store::{DeleteOptions, ObjectStore},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Call {
    pub op: Op,
    pub kind: AddonKind,
    /// Object name, or the label selector of a list call.
    pub target: String,
    pub options: Option<DeleteOptions>,
}

impl Call {
    pub(crate) fn is_mutation(&self) -> bool {
        matches!(self.op, Op::Create | Op::Update | Op::Delete)
    }
}

type Key = (AddonKind, String, String);

struct Entry {
    obj: DynamicObject,
    deleted_at: Option<Instant>,
}

struct Failure {
    op: Op,
    kind: AddonKind,
    name: Option<String>,
    code: u16,
    reason: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Entry>,
    calls: Vec<Call>,
    failures: Vec<Failure>,
    next_uid: u64,
}

#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<State>,
    deletion_delay: Duration,
}

/// Build a minimal object of the given kind.
pub(crate) fn object(
    kind: AddonKind,
    namespace: Option<&str>,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: kind.gvk().api_version(),
            kind: kind.as_str().to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(|v| v.to_string()),
            labels,
            ..Default::default()
        },
        data: serde_json::json!({}),
    }
}

fn key(kind: AddonKind, namespace: Option<&str>, name: &str) -> Key {
    let namespace = if kind.is_cluster_scoped() {
        ""
    } else {
        namespace.unwrap_or("")
    };
    (kind, namespace.to_string(), name.to_string())
}

fn not_found(kind: AddonKind, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{} {} not found", kind, name))
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(|l| l.as_str()) == Some(v),
            None => labels.contains_key(term),
        })
}

impl FakeStore {
    /// Deleted objects stay visible (and their names stay taken) for `delay`.
    pub(crate) fn with_deletion_delay(mut self, delay: Duration) -> Self {
        self.deletion_delay = delay;
        self
    }

    /// Let every matching call fail with the given API status.
    pub(crate) fn fail_on(&self, op: Op, kind: AddonKind, name: Option<&str>, code: u16, reason: &str) {
        self.lock().failures.push(Failure {
            op,
            kind,
            name: name.map(|v| v.to_string()),
            code,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// All present objects of the given kind.
    pub(crate) fn objects(&self, kind: AddonKind) -> Vec<DynamicObject> {
        let mut state = self.lock();
        self.purge(&mut state);
        state
            .objects
            .iter()
            .filter(|((k, _, _), e)| *k == kind && e.deleted_at.is_none())
            .map(|(_, e)| e.obj.clone())
            .collect()
    }

    pub(crate) fn find(&self, kind: AddonKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let mut state = self.lock();
        self.purge(&mut state);
        state
            .objects
            .get(&key(kind, namespace, name))
            .filter(|e| e.deleted_at.is_none())
            .map(|e| e.obj.clone())
    }

    pub(crate) fn len(&self) -> usize {
        let mut state = self.lock();
        self.purge(&mut state);
        state.objects.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn purge(&self, state: &mut State) {
        let now = Instant::now();
        let delay = self.deletion_delay;
        state
            .objects
            .retain(|_, e| e.deleted_at.map(|t| now < t + delay).unwrap_or(true));
    }

    /// Record the call and return the injected failure, if any.
    fn enter(
        &self,
        state: &mut State,
        op: Op,
        kind: AddonKind,
        target: &str,
        options: Option<DeleteOptions>,
    ) -> Result<(), kube::Error> {
        self.purge(state);
        state.calls.push(Call {
            op,
            kind,
            target: target.to_string(),
            options,
        });
        match state.failures.iter().find(|f| {
            f.op == op && f.kind == kind && f.name.as_deref().map(|n| n == target).unwrap_or(true)
        }) {
            Some(f) => Err(api_error(
                f.code,
                f.reason.as_str(),
                format!("injected failure for {} {}", kind, target),
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<DynamicObject> {
        let mut state = self.lock();
        self.enter(&mut state, Op::Get, kind, name, None)?;
        state
            .objects
            .get(&key(kind, namespace, name))
            .map(|e| e.obj.clone())
            .ok_or_else(|| not_found(kind, name))
    }

    async fn create(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let name = obj.name_any();
        let mut state = self.lock();
        self.enter(&mut state, Op::Create, kind, name.as_str(), None)?;
        let k = key(kind, obj.namespace().as_deref(), name.as_str());
        if state.objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", kind, name),
            ));
        }
        state.next_uid += 1;
        let mut created = obj.clone();
        created.metadata.uid = Some(format!("uid-{}", state.next_uid));
        created.metadata.resource_version = Some("1".to_string());
        state.objects.insert(
            k,
            Entry {
                obj: created.clone(),
                deleted_at: None,
            },
        );
        Ok(created)
    }

    async fn update(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        let name = obj.name_any();
        let mut state = self.lock();
        self.enter(&mut state, Op::Update, kind, name.as_str(), None)?;
        let entry = state
            .objects
            .get_mut(&key(kind, obj.namespace().as_deref(), name.as_str()))
            .filter(|e| e.deleted_at.is_none())
            .ok_or_else(|| not_found(kind, name.as_str()))?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != entry.obj.metadata.resource_version
        {
            return Err(api_error(
                409,
                "Conflict",
                format!("{} {} has been modified", kind, name),
            ));
        }
        let version: u64 = entry
            .obj
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut updated = obj.clone();
        updated.metadata.uid = entry.obj.metadata.uid.clone();
        updated.metadata.resource_version = Some((version + 1).to_string());
        entry.obj = updated.clone();
        Ok(updated)
    }

    async fn delete(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> kube::Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, Op::Delete, kind, name, Some(options))?;
        let k = key(kind, namespace, name);
        if !state.objects.contains_key(&k) {
            return Err(not_found(kind, name));
        }
        if self.deletion_delay.is_zero() {
            state.objects.remove(&k);
        } else if let Some(entry) = state.objects.get_mut(&k) {
            if entry.deleted_at.is_none() {
                entry.deleted_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        let mut state = self.lock();
        self.enter(&mut state, Op::List, kind, selector, None)?;
        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            namespace
        };
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| {
                *k == kind && namespace.map(|n| n == ns.as_str()).unwrap_or(true)
            })
            .map(|(_, e)| e.obj.clone())
            .filter(|o| matches_selector(o, selector))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_unique() {
        let store = FakeStore::default();
        let cm = object(AddonKind::ConfigMap, Some("ns"), "cm", None);
        store.create(AddonKind::ConfigMap, &cm).await.unwrap();
        let err = store.create(AddonKind::ConfigMap, &cm).await.unwrap_err();
        assert!(matches!(err, kube::Error::Api(e) if e.code == 409));
        // same name in another namespace is fine
        let other = object(AddonKind::ConfigMap, Some("other"), "cm", None);
        store.create(AddonKind::ConfigMap, &other).await.unwrap();
        assert_eq!(2, store.objects(AddonKind::ConfigMap).len());
    }

    #[tokio::test]
    async fn list_by_selector() {
        let store = FakeStore::default();
        let mut labels = BTreeMap::new();
        labels.insert("nodepool_name".to_string(), "a".to_string());
        let a = object(AddonKind::Service, Some("ns"), "a", Some(labels));
        let b = object(AddonKind::Service, Some("ns"), "b", None);
        store.create(AddonKind::Service, &a).await.unwrap();
        store.create(AddonKind::Service, &b).await.unwrap();
        let found = store
            .list(AddonKind::Service, Some("ns"), "nodepool_name=a")
            .await
            .unwrap();
        assert_eq!(vec!["a".to_string()], found.iter().map(|o| o.name_any()).collect::<Vec<_>>());
        assert!(
            store
                .list(AddonKind::Service, Some("ns"), "nodepool_name=b")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_deletion_keeps_name_taken() {
        let store = FakeStore::default().with_deletion_delay(Duration::from_secs(1));
        let job = object(AddonKind::Job, Some("ns"), "job", None);
        store.create(AddonKind::Job, &job).await.unwrap();
        store
            .delete(AddonKind::Job, Some("ns"), "job", Default::default())
            .await
            .unwrap();
        assert!(store.create(AddonKind::Job, &job).await.is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        store.create(AddonKind::Job, &job).await.unwrap();
    }
}
