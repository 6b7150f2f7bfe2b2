use std::{collections::BTreeMap, sync::OnceLock};

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};

/// The namespace every namespaced addon object lives in.
pub const NAMESPACE: &'static str = "ingress-nginx";

/// Label key (and template parameter) carrying the node pool name of pool-scoped objects.
pub const POOL_LABEL: &'static str = "nodepool_name";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// No template is registered under the given identifier.
    #[error("template {0} not found")]
    TemplateNotFound(String),
    /// The template references a parameter which was not supplied.
    #[error("template {template} requires parameter {parameter}")]
    MissingParameter { template: String, parameter: String },
    /// The template or the substituted text is not a valid manifest.
    #[error("template {template} is malformed: {message}")]
    Malformed { template: String, message: String },
    /// The rendered manifest declares another kind than the template is registered for.
    #[error("template {template} rendered kind {actual}, expected {expected}")]
    KindMismatch {
        template: String,
        expected: String,
        actual: String,
    },
}

/// The fixed set of Kubernetes kinds the addon is made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddonKind {
    Namespace,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    ServiceAccount,
    ConfigMap,
    Deployment,
    Service,
    ValidatingWebhookConfiguration,
    Job,
}

impl AddonKind {
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self {
            AddonKind::Namespace
            | AddonKind::ServiceAccount
            | AddonKind::ConfigMap
            | AddonKind::Service => ("", "v1"),
            AddonKind::ClusterRole
            | AddonKind::ClusterRoleBinding
            | AddonKind::Role
            | AddonKind::RoleBinding => ("rbac.authorization.k8s.io", "v1"),
            AddonKind::Deployment => ("apps", "v1"),
            AddonKind::ValidatingWebhookConfiguration => ("admissionregistration.k8s.io", "v1"),
            AddonKind::Job => ("batch", "v1"),
        };
        GroupVersionKind::gvk(group, version, self.as_str())
    }

    pub fn plural(&self) -> &'static str {
        match self {
            AddonKind::Namespace => "namespaces",
            AddonKind::ClusterRole => "clusterroles",
            AddonKind::ClusterRoleBinding => "clusterrolebindings",
            AddonKind::Role => "roles",
            AddonKind::RoleBinding => "rolebindings",
            AddonKind::ServiceAccount => "serviceaccounts",
            AddonKind::ConfigMap => "configmaps",
            AddonKind::Deployment => "deployments",
            AddonKind::Service => "services",
            AddonKind::ValidatingWebhookConfiguration => "validatingwebhookconfigurations",
            AddonKind::Job => "jobs",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddonKind::Namespace => "Namespace",
            AddonKind::ClusterRole => "ClusterRole",
            AddonKind::ClusterRoleBinding => "ClusterRoleBinding",
            AddonKind::Role => "Role",
            AddonKind::RoleBinding => "RoleBinding",
            AddonKind::ServiceAccount => "ServiceAccount",
            AddonKind::ConfigMap => "ConfigMap",
            AddonKind::Deployment => "Deployment",
            AddonKind::Service => "Service",
            AddonKind::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            AddonKind::Job => "Job",
        }
    }

    /// Whether objects of this kind live outside of any namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            AddonKind::Namespace
                | AddonKind::ClusterRole
                | AddonKind::ClusterRoleBinding
                | AddonKind::ValidatingWebhookConfiguration
        )
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), self.plural())
    }
}

impl std::fmt::Display for AddonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime of the objects rendered from a template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sharing {
    /// Created once per cluster and shared by all node pools.
    Cluster,
    /// One instance per node pool, tagged with [`POOL_LABEL`].
    Pool,
}

/// Identifier of an embedded addon manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Template {
    Namespace,
    ControllerClusterRole,
    AdmissionClusterRole,
    ControllerClusterRoleBinding,
    AdmissionClusterRoleBinding,
    ControllerRole,
    AdmissionRole,
    ControllerRoleBinding,
    AdmissionRoleBinding,
    ControllerServiceAccount,
    AdmissionServiceAccount,
    ControllerConfigMap,
    ControllerDeployment,
    AdmissionDeployment,
    ControllerService,
    AdmissionService,
    ValidatingWebhook,
    AdmissionCreateJob,
    AdmissionPatchJob,
}

impl Template {
    pub const ALL: [Template; 19] = [
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
        Template::ControllerDeployment,
        Template::AdmissionDeployment,
        Template::ControllerService,
        Template::AdmissionService,
        Template::ValidatingWebhook,
        Template::AdmissionCreateJob,
        Template::AdmissionPatchJob,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Template::Namespace => "namespace",
            Template::ControllerClusterRole => "controller-clusterrole",
            Template::AdmissionClusterRole => "admission-clusterrole",
            Template::ControllerClusterRoleBinding => "controller-clusterrolebinding",
            Template::AdmissionClusterRoleBinding => "admission-clusterrolebinding",
            Template::ControllerRole => "controller-role",
            Template::AdmissionRole => "admission-role",
            Template::ControllerRoleBinding => "controller-rolebinding",
            Template::AdmissionRoleBinding => "admission-rolebinding",
            Template::ControllerServiceAccount => "controller-serviceaccount",
            Template::AdmissionServiceAccount => "admission-serviceaccount",
            Template::ControllerConfigMap => "controller-configmap",
            Template::ControllerDeployment => "controller-deployment",
            Template::AdmissionDeployment => "admission-deployment",
            Template::ControllerService => "controller-service",
            Template::AdmissionService => "admission-service",
            Template::ValidatingWebhook => "validating-webhook",
            Template::AdmissionCreateJob => "admission-create-job",
            Template::AdmissionPatchJob => "admission-patch-job",
        }
    }

    pub fn from_id(id: &str) -> Result<Template, RenderError> {
        Template::ALL
            .iter()
            .copied()
            .find(|t| t.id() == id)
            .ok_or_else(|| RenderError::TemplateNotFound(id.to_string()))
    }

    pub fn kind(&self) -> AddonKind {
        match self {
            Template::Namespace => AddonKind::Namespace,
            Template::ControllerClusterRole | Template::AdmissionClusterRole => {
                AddonKind::ClusterRole
            }
            Template::ControllerClusterRoleBinding | Template::AdmissionClusterRoleBinding => {
                AddonKind::ClusterRoleBinding
            }
            Template::ControllerRole | Template::AdmissionRole => AddonKind::Role,
            Template::ControllerRoleBinding | Template::AdmissionRoleBinding => {
                AddonKind::RoleBinding
            }
            Template::ControllerServiceAccount | Template::AdmissionServiceAccount => {
                AddonKind::ServiceAccount
            }
            Template::ControllerConfigMap => AddonKind::ConfigMap,
            Template::ControllerDeployment | Template::AdmissionDeployment => AddonKind::Deployment,
            Template::ControllerService | Template::AdmissionService => AddonKind::Service,
            Template::ValidatingWebhook => AddonKind::ValidatingWebhookConfiguration,
            Template::AdmissionCreateJob | Template::AdmissionPatchJob => AddonKind::Job,
        }
    }

    pub fn sharing(&self) -> Sharing {
        match self {
            Template::ControllerDeployment
            | Template::AdmissionDeployment
            | Template::ControllerService
            | Template::AdmissionService
            | Template::ValidatingWebhook
            | Template::AdmissionCreateJob
            | Template::AdmissionPatchJob => Sharing::Pool,
            _ => Sharing::Cluster,
        }
    }

    fn manifest(&self) -> &'static str {
        match self {
            Template::Namespace => include_str!("../manifests/namespace.yaml"),
            Template::ControllerClusterRole => {
                include_str!("../manifests/controller-clusterrole.yaml")
            }
            Template::AdmissionClusterRole => include_str!("../manifests/admission-clusterrole.yaml"),
            Template::ControllerClusterRoleBinding => {
                include_str!("../manifests/controller-clusterrolebinding.yaml")
            }
            Template::AdmissionClusterRoleBinding => {
                include_str!("../manifests/admission-clusterrolebinding.yaml")
            }
            Template::ControllerRole => include_str!("../manifests/controller-role.yaml"),
            Template::AdmissionRole => include_str!("../manifests/admission-role.yaml"),
            Template::ControllerRoleBinding => {
                include_str!("../manifests/controller-rolebinding.yaml")
            }
            Template::AdmissionRoleBinding => include_str!("../manifests/admission-rolebinding.yaml"),
            Template::ControllerServiceAccount => {
                include_str!("../manifests/controller-serviceaccount.yaml")
            }
            Template::AdmissionServiceAccount => {
                include_str!("../manifests/admission-serviceaccount.yaml")
            }
            Template::ControllerConfigMap => include_str!("../manifests/controller-configmap.yaml"),
            Template::ControllerDeployment => include_str!("../manifests/controller-deployment.yaml"),
            Template::AdmissionDeployment => include_str!("../manifests/admission-deployment.yaml"),
            Template::ControllerService => include_str!("../manifests/controller-service.yaml"),
            Template::AdmissionService => include_str!("../manifests/admission-service.yaml"),
            Template::ValidatingWebhook => include_str!("../manifests/validating-webhook.yaml"),
            Template::AdmissionCreateJob => include_str!("../manifests/admission-create-job.yaml"),
            Template::AdmissionPatchJob => include_str!("../manifests/admission-patch-job.yaml"),
        }
    }

    /// Render the manifest with the given parameters into an object ready to be sent
    /// to the API server.
    pub fn render(&self, params: &TemplateParams) -> Result<DynamicObject, RenderError> {
        render(*self, params)
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Values of the `{{ name }}` variables of a manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<String, String>,
}

impl TemplateParams {
    pub fn new() -> Self {
        Default::default()
    }

    /// Parameters of a pool-scoped manifest.
    pub fn for_pool(pool: &str) -> Self {
        Self::new().with(POOL_LABEL, pool)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }
}

pub fn render(template: Template, params: &TemplateParams) -> Result<DynamicObject, RenderError> {
    let text = substitute(template, environment()?, params)?;
    let obj: DynamicObject =
        serde_yaml::from_str(&text).map_err(|e| RenderError::Malformed {
            template: template.id().to_string(),
            message: e.to_string(),
        })?;
    let expected = template.kind().as_str();
    let actual = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    if actual != expected {
        return Err(RenderError::KindMismatch {
            template: template.id().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(obj)
}

/// An environment failing on undefined values instead of rendering them empty.
fn strict_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// All embedded manifests, registered under their template id.
fn environment() -> Result<&'static Environment<'static>, RenderError> {
    static ENVIRONMENT: OnceLock<Result<Environment<'static>, RenderError>> = OnceLock::new();
    ENVIRONMENT
        .get_or_init(|| {
            let mut env = strict_environment();
            for template in Template::ALL {
                env.add_template(template.id(), template.manifest())
                    .map_err(|e| template_error(template, e))?;
            }
            Ok(env)
        })
        .as_ref()
        .map_err(|e| e.clone())
}

fn template_error(template: Template, err: minijinja::Error) -> RenderError {
    match err.kind() {
        ErrorKind::UndefinedError => RenderError::MissingParameter {
            template: template.id().to_string(),
            parameter: err.detail().unwrap_or_default().to_string(),
        },
        ErrorKind::TemplateNotFound => RenderError::TemplateNotFound(template.id().to_string()),
        _ => RenderError::Malformed {
            template: template.id().to_string(),
            message: err.to_string(),
        },
    }
}

fn substitute(
    template: Template,
    env: &Environment<'_>,
    params: &TemplateParams,
) -> Result<String, RenderError> {
    let tmpl = env
        .get_template(template.id())
        .map_err(|e| template_error(template, e))?;
    let mut missing: Vec<String> = tmpl
        .undeclared_variables(false)
        .into_iter()
        .filter(|v| params.get(v).is_none())
        .collect();
    missing.sort();
    if let Some(parameter) = missing.into_iter().next() {
        return Err(RenderError::MissingParameter {
            template: template.id().to_string(),
            parameter,
        });
    }
    tmpl.render(&params.values)
        .map_err(|e| template_error(template, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    fn params_for(template: Template) -> TemplateParams {
        match template.sharing() {
            Sharing::Cluster => TemplateParams::new(),
            Sharing::Pool => TemplateParams::for_pool("hangzhou"),
        }
    }

    #[test]
    fn all_templates_render() {
        for template in Template::ALL {
            let obj = render(template, &params_for(template)).unwrap();
            let types = obj.types.as_ref().unwrap();
            assert_eq!(template.kind().gvk().api_version(), types.api_version);
            assert_eq!(template.kind().as_str(), types.kind);
            assert_eq!(
                template.kind().is_cluster_scoped(),
                obj.namespace().is_none(),
                "namespace of {}",
                template
            );
        }
    }

    #[test]
    fn pool_templates_are_labeled_and_named_after_the_pool() {
        for template in Template::ALL
            .iter()
            .filter(|t| t.sharing() == Sharing::Pool)
        {
            let obj = template.render(&TemplateParams::for_pool("hangzhou")).unwrap();
            assert_eq!(
                Some(&"hangzhou".to_string()),
                obj.labels().get(POOL_LABEL),
                "label of {}",
                template
            );
            assert!(obj.name_any().starts_with("hangzhou-"), "{}", obj.name_any());
        }
    }

    #[test]
    fn shared_templates_carry_no_pool_label() {
        for template in Template::ALL
            .iter()
            .filter(|t| t.sharing() == Sharing::Cluster)
        {
            let obj = template.render(&TemplateParams::new()).unwrap();
            assert!(obj.labels().get(POOL_LABEL).is_none());
        }
    }

    #[test]
    fn pool_names_do_not_collide() {
        let a = render(Template::ControllerDeployment, &TemplateParams::for_pool("a")).unwrap();
        let b = render(Template::ControllerDeployment, &TemplateParams::for_pool("b")).unwrap();
        assert_ne!(a.name_any(), b.name_any());
    }

    #[test]
    fn missing_parameter() {
        assert_eq!(
            Err(RenderError::MissingParameter {
                template: "controller-service".to_string(),
                parameter: POOL_LABEL.to_string(),
            }),
            render(Template::ControllerService, &TemplateParams::new())
        );
    }

    #[test]
    fn unterminated_placeholder() {
        let mut env = strict_environment();
        let err = env
            .add_template(Template::Namespace.id(), "name: {{ nodepool_name")
            .map_err(|e| template_error(Template::Namespace, e))
            .unwrap_err();
        assert!(matches!(err, RenderError::Malformed { .. }), "{:?}", err);
    }

    #[test]
    fn undefined_value_is_an_error() {
        let mut env = strict_environment();
        env.add_template(Template::Namespace.id(), "name: {{ pool.name }}")
            .unwrap();
        let err = substitute(Template::Namespace, &env, &TemplateParams::new()).unwrap_err();
        assert_eq!(
            RenderError::MissingParameter {
                template: "namespace".to_string(),
                parameter: "pool".to_string(),
            },
            err
        );
        let err = env
            .get_template(Template::Namespace.id())
            .unwrap()
            .render(minijinja::context! {})
            .map_err(|e| template_error(Template::Namespace, e))
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingParameter { .. }), "{:?}", err);
    }

    #[test]
    fn all_manifests_are_registered() {
        let env = environment().unwrap();
        for template in Template::ALL {
            assert!(env.get_template(template.id()).is_ok(), "{}", template);
        }
    }

    #[test]
    fn malformed_parameter_value() {
        let err = render(
            Template::ControllerService,
            &TemplateParams::for_pool("bad\"\n  - ["),
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::Malformed { .. }), "{:?}", err);
    }

    #[test]
    fn from_id() {
        for template in Template::ALL {
            assert_eq!(Ok(template), Template::from_id(template.id()));
        }
        assert_eq!(
            Err(RenderError::TemplateNotFound("ingress".to_string())),
            Template::from_id("ingress")
        );
    }

    #[test]
    fn kinds_are_complete() {
        let kinds: std::collections::BTreeSet<AddonKind> =
            Template::ALL.iter().map(|t| t.kind()).collect();
        assert_eq!(11, kinds.len());
        assert_eq!(
            12,
            Template::ALL
                .iter()
                .filter(|t| t.sharing() == Sharing::Cluster)
                .count()
        );
    }
}
