use async_trait::async_trait;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, ListParams, PostParams},
};
use kube_runtime::wait::{await_condition, conditions};
use nodepool_ingress_templates::AddonKind;
use tokio::time::{Duration, Instant, sleep, timeout};

use crate::{MANAGER, errors::ExtKubeApiError, owner::is_unresolved};

/// Interval between two lookups while waiting for an object to disappear.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Options of a delete call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DeleteOptions {
    /// Delete dependents (e.g. the pods of a Job) together with the object instead of
    /// leaving them to the server's default policy.
    pub force_cleanup: bool,
}

impl DeleteOptions {
    pub(crate) fn force_cleanup(force_cleanup: bool) -> Self {
        Self { force_cleanup }
    }

    fn delete_params(&self) -> DeleteParams {
        if self.force_cleanup {
            DeleteParams::background()
        } else {
            DeleteParams::default()
        }
    }
}

/// Remote object store holding the addon objects.
///
/// Objects are addressed by kind, namespace (ignored for cluster scoped kinds)
/// and name.
#[async_trait]
pub(crate) trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<DynamicObject>;

    async fn create(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject>;

    async fn update(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject>;

    async fn delete(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> kube::Result<()>;

    async fn list(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> kube::Result<Vec<DynamicObject>>;

    /// Wait until the object no longer exists, returns `false` if it still
    /// exists after `timeout`.
    async fn wait_absent(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
        timeout: Duration,
    ) -> kube::Result<bool> {
        poll_until_absent(self, kind, namespace, name, Instant::now() + timeout).await
    }
}

pub(crate) async fn poll_until_absent<S>(
    store: &S,
    kind: AddonKind,
    namespace: Option<&str>,
    name: &str,
    deadline: Instant,
) -> kube::Result<bool>
where
    S: ObjectStore + ?Sized,
{
    loop {
        match store.get(kind, namespace, name).await {
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e),
            Ok(_) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                sleep(POLL_INTERVAL.min(deadline - now)).await;
            }
        }
    }
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub(crate) struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: AddonKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let api_resource = kind.api_resource();
        match namespace {
            Some(ns) if !kind.is_cluster_scoped() => {
                Api::namespaced_with(self.client.clone(), ns, &api_resource)
            }
            _ => Api::all_with(self.client.clone(), &api_resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(MANAGER.to_string()),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
    ) -> kube::Result<DynamicObject> {
        self.api(kind, namespace).get(name).await
    }

    async fn create(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        // The API server rejects owner references without uid.
        let mut obj = obj.clone();
        obj.metadata.owner_references = obj
            .metadata
            .owner_references
            .take()
            .map(|refs| {
                refs.into_iter()
                    .filter(|r| !is_unresolved(r))
                    .collect::<Vec<_>>()
            })
            .filter(|refs| !refs.is_empty());
        self.api(kind, obj.namespace().as_deref())
            .create(&Self::post_params(), &obj)
            .await
    }

    async fn update(&self, kind: AddonKind, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        self.api(kind, obj.namespace().as_deref())
            .replace(obj.name_any().as_str(), &Self::post_params(), obj)
            .await
    }

    async fn delete(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> kube::Result<()> {
        self.api(kind, namespace)
            .delete(name, &options.delete_params())
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        selector: &str,
    ) -> kube::Result<Vec<DynamicObject>> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn wait_absent(
        &self,
        kind: AddonKind,
        namespace: Option<&str>,
        name: &str,
        wait: Duration,
    ) -> kube::Result<bool> {
        let deadline = Instant::now() + wait;
        let api = self.api(kind, namespace);
        let uid = match api.get_opt(name).await? {
            Some(obj) => obj.uid().unwrap_or_default(),
            None => return Ok(true),
        };
        match timeout(wait, await_condition(api, name, conditions::is_deleted(&uid))).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                warn!(
                    "failed to watch {} {} for deletion, falling back to polling: {}",
                    kind, name, e
                );
                poll_until_absent(self, kind, namespace, name, deadline).await
            }
            Err(_) => Ok(false),
        }
    }
}
