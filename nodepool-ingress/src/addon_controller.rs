use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use nodepool_ingress_templates::{AddonKind, NAMESPACE, Template};

use crate::{
    Configuration,
    errors::AddonError,
    owner::{self, ManagerIdentity},
    scope::PoolScope,
    sequence::{Progress, Sequence, SequenceRunner, Step},
    store::{DeleteOptions, ObjectStore},
    utils::Overrides,
};

/// Cluster-shared objects in creation order, each kind before its consumers.
const COMMON_INSTALL_ORDER: [Template; 12] = [
    Template::Namespace,
    Template::ControllerClusterRole,
    Template::AdmissionClusterRole,
    Template::ControllerClusterRoleBinding,
    Template::AdmissionClusterRoleBinding,
    Template::ControllerRole,
    Template::AdmissionRole,
    Template::ControllerRoleBinding,
    Template::AdmissionRoleBinding,
    Template::ControllerServiceAccount,
    Template::AdmissionServiceAccount,
    Template::ControllerConfigMap,
];

/// Cluster-shared objects in deletion order: bindings before the roles they
/// reference, the namespace last.
const COMMON_UNINSTALL_ORDER: [Template; 12] = [
    Template::ControllerConfigMap,
    Template::ControllerRoleBinding,
    Template::AdmissionRoleBinding,
    Template::ControllerRole,
    Template::AdmissionRole,
    Template::ControllerClusterRoleBinding,
    Template::AdmissionClusterRoleBinding,
    Template::ControllerClusterRole,
    Template::AdmissionClusterRole,
    Template::ControllerServiceAccount,
    Template::AdmissionServiceAccount,
    Template::Namespace,
];

const POOL_UNINSTALL_ORDER: [Template; 7] = [
    Template::ControllerDeployment,
    Template::AdmissionDeployment,
    Template::ControllerService,
    Template::AdmissionService,
    Template::ValidatingWebhook,
    Template::AdmissionCreateJob,
    Template::AdmissionPatchJob,
];

/// The admission webhook deployment always runs a single replica.
const ADMISSION_REPLICAS: i32 = 1;

/// Parameters of a node pool's addon instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PoolInstall {
    pub external_ips: Vec<String>,
    pub controller_image: String,
    /// Image of the certificate jobs.
    pub webhook_image: String,
    pub replicas: i32,
    /// Attached to the controller deployment and the validating webhook configuration.
    pub owner: Option<OwnerReference>,
}

/// Installs, mutates and removes the ingress addon.
///
/// Every operation is a one-shot ordered sequence of API calls which stops at the
/// first error. There is no reconciliation: converging after a partial failure
/// means invoking the same operation again. Operations for the same node pool
/// (and for the cluster-shared objects) must be serialized by the caller.
pub(crate) struct IngressAddonController<S: ObjectStore> {
    store: S,
    configuration: Configuration,
}

impl<S: ObjectStore> IngressAddonController<S> {
    pub(crate) fn new(store: S, configuration: Configuration) -> Self {
        Self {
            store,
            configuration,
        }
    }

    fn runner(&self) -> SequenceRunner<'_, S> {
        SequenceRunner::new(&self.store, !self.configuration.fail_on_existing)
    }

    fn manager(&self) -> ManagerIdentity {
        ManagerIdentity::cluster_role(self.configuration.manager_cluster_role.as_str())
    }

    /// Owner reference to the addon manager, zero-valued if the manager does not exist.
    pub(crate) async fn resolve_owner(&self) -> OwnerReference {
        owner::resolve(&self.store, &self.manager()).await
    }

    /// Whether the addon namespace exists and is active.
    pub(crate) async fn is_ingress_namespace_ready(&self) -> bool {
        match self.store.get(AddonKind::Namespace, None, NAMESPACE).await {
            Ok(ns) => ns
                .data
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(|p| p.as_str())
                == Some("Active"),
            Err(e) => {
                debug!("namespace {} is not ready: {}", NAMESPACE, e);
                false
            }
        }
    }

    /// Create the cluster-shared objects, all owned by the addon manager.
    pub(crate) async fn install_common_resources(&self) -> Result<Progress, AddonError> {
        let owner = self.resolve_owner().await;
        if owner::is_unresolved(&owner) {
            warn!(
                "addon manager {} not found, cluster-shared objects are created with an empty owner reference",
                self.configuration.manager_cluster_role
            );
        }
        let overrides = Overrides {
            owner_references: vec![owner],
            ..Default::default()
        };
        let sequence = Sequence {
            name: "install common resources",
            scope: None,
            steps: COMMON_INSTALL_ORDER
                .iter()
                .map(|t| Step::create(*t, overrides.clone()))
                .collect(),
        };
        self.runner().run(&sequence).await
    }

    pub(crate) async fn uninstall_common_resources(&self) -> Result<Progress, AddonError> {
        let sequence = Sequence {
            name: "uninstall common resources",
            scope: None,
            steps: COMMON_UNINSTALL_ORDER
                .iter()
                .map(|t| Step::delete(*t, DeleteOptions::default()))
                .collect(),
        };
        self.runner().run(&sequence).await
    }

    /// Create the objects of one node pool's addon instance.
    pub(crate) async fn install_pool_resources(
        &self,
        pool: &str,
        install: &PoolInstall,
    ) -> Result<Progress, AddonError> {
        let owner_references: Vec<OwnerReference> = install.owner.iter().cloned().collect();
        let steps = vec![
            Step::create(
                Template::ControllerDeployment,
                Overrides {
                    replicas: Some(install.replicas),
                    image: Some(install.controller_image.clone()),
                    owner_references: owner_references.clone(),
                    ..Default::default()
                },
            ),
            Step::create(
                Template::AdmissionDeployment,
                Overrides {
                    replicas: Some(ADMISSION_REPLICAS),
                    image: Some(install.controller_image.clone()),
                    ..Default::default()
                },
            ),
            Step::create(
                Template::ControllerService,
                Overrides {
                    external_ips: Some(install.external_ips.clone()),
                    ..Default::default()
                },
            ),
            Step::create(Template::AdmissionService, Overrides::default()),
            Step::create(
                Template::ValidatingWebhook,
                Overrides {
                    owner_references,
                    ..Default::default()
                },
            ),
            Step::create(Template::AdmissionCreateJob, job_overrides(&install.webhook_image)),
            Step::create(Template::AdmissionPatchJob, job_overrides(&install.webhook_image)),
        ];
        self.runner()
            .run(&Sequence {
                name: "install pool resources",
                scope: Some(PoolScope::new(pool)),
                steps,
            })
            .await
    }

    /// Delete the objects of one node pool's addon instance. `force_cleanup` only
    /// applies to the certificate jobs, deleting their pods along with them.
    pub(crate) async fn uninstall_pool_resources(
        &self,
        pool: &str,
        force_cleanup: bool,
    ) -> Result<Progress, AddonError> {
        let steps = POOL_UNINSTALL_ORDER
            .iter()
            .map(|t| {
                let options = match t.kind() {
                    AddonKind::Job => DeleteOptions::force_cleanup(force_cleanup),
                    _ => DeleteOptions::default(),
                };
                Step::delete(*t, options)
            })
            .collect();
        self.runner()
            .run(&Sequence {
                name: "uninstall pool resources",
                scope: Some(PoolScope::new(pool)),
                steps,
            })
            .await
    }

    /// Change the replica count of the pool's controller deployment, keeping its image.
    pub(crate) async fn scale_controller_deployment(
        &self,
        pool: &str,
        replicas: i32,
    ) -> Result<Progress, AddonError> {
        self.update_controller_deployment(pool, replicas, "").await
    }

    /// Update replicas and image of the pool's controller deployment and the image of
    /// its admission webhook deployment, so both run the same version. An empty
    /// image leaves the images untouched and skips the webhook deployment, whose
    /// replicas are then not pinned back to one.
    pub(crate) async fn update_controller_deployment(
        &self,
        pool: &str,
        replicas: i32,
        image: &str,
    ) -> Result<Progress, AddonError> {
        let image = Some(image.to_string()).filter(|i| !i.is_empty());
        let mut steps = vec![Step::update(
            Template::ControllerDeployment,
            Overrides {
                replicas: Some(replicas),
                image: image.clone(),
                ..Default::default()
            },
        )];
        if image.is_some() {
            steps.push(Step::update(
                Template::AdmissionDeployment,
                Overrides {
                    replicas: Some(ADMISSION_REPLICAS),
                    image,
                    ..Default::default()
                },
            ));
        }
        self.runner()
            .run(&Sequence {
                name: "update controller deployment",
                scope: Some(PoolScope::new(pool)),
                steps,
            })
            .await
    }

    /// Replace the external IPs of the pool's controller service, an empty list removes them.
    pub(crate) async fn update_service_external_ips(
        &self,
        pool: &str,
        external_ips: &[String],
    ) -> Result<Progress, AddonError> {
        self.runner()
            .run(&Sequence {
                name: "update service external ips",
                scope: Some(PoolScope::new(pool)),
                steps: vec![Step::update(
                    Template::ControllerService,
                    Overrides {
                        external_ips: Some(external_ips.to_vec()),
                        ..Default::default()
                    },
                )],
            })
            .await
    }

    /// Delete and recreate the certificate jobs of a pool with a new image.
    ///
    /// Job names are reused, so the jobs are only created again after the settle
    /// delay has passed and both deleted jobs are gone. If they don't disappear
    /// within the recreate timeout the call fails with
    /// [`AddonError::RecreateTimeout`] and nothing is created.
    pub(crate) async fn recreate_webhook_jobs(
        &self,
        pool: &str,
        image: &str,
    ) -> Result<Progress, AddonError> {
        let settle = self.configuration.job_settle_delay;
        let timeout = self.configuration.job_recreate_timeout;
        let steps = vec![
            Step::delete(Template::AdmissionCreateJob, DeleteOptions::default()),
            Step::delete(Template::AdmissionPatchJob, DeleteOptions::default()),
            Step::await_absent(Template::AdmissionCreateJob, settle, timeout),
            Step::await_absent(Template::AdmissionPatchJob, Default::default(), timeout),
            Step::create(Template::AdmissionCreateJob, job_overrides(image)),
            Step::create(Template::AdmissionPatchJob, job_overrides(image)),
        ];
        self.runner()
            .run(&Sequence {
                name: "recreate webhook jobs",
                scope: Some(PoolScope::new(pool)),
                steps,
            })
            .await
    }
}

fn job_overrides(image: &str) -> Overrides {
    Overrides {
        image: Some(image.to_string()).filter(|i| !i.is_empty()),
        ..Default::default()
    }
}
