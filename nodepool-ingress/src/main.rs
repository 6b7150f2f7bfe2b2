#[macro_use]
extern crate log;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use nodepool_ingress_templates::{POOL_LABEL, RenderError, Sharing, Template, TemplateParams};
use tokio::time::Duration;

mod addon_controller;
use addon_controller::*;
mod errors;
#[cfg(test)]
mod fake_store;
mod owner;
mod scope;
mod sequence;
mod store;
mod utils;

use errors::AddonError;
use scope::PoolScope;
use store::KubeStore;

/// The K8s field manager name.
const MANAGER: &'static str = "nodepool-ingress";

const DEFAULT_MANAGER_CLUSTER_ROLE: &'static str = "nodepool-ingress-manager-role";

#[derive(Clone, Debug, PartialEq)]
struct Configuration {
    /// Name of the ClusterRole owning the cluster-shared objects.
    manager_cluster_role: String,
    /// Fail instead of adopting objects which already exist on create.
    fail_on_existing: bool,
    /// Unconditional pause between deleting and recreating the certificate jobs.
    job_settle_delay: Duration,
    /// How long to wait for deleted certificate jobs to disappear after the settle delay.
    job_recreate_timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            manager_cluster_role: DEFAULT_MANAGER_CLUSTER_ROLE.to_string(),
            fail_on_existing: false,
            job_settle_delay: Duration::from_secs(3),
            job_recreate_timeout: Duration::from_secs(30),
        }
    }
}

impl Configuration {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let seconds = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(name) {
                Some(v) => Ok(Duration::from_secs(v.parse().with_context(|| {
                    format!("{} must be a number of seconds, got {}", name, v)
                })?)),
                None => Ok(default),
            }
        };
        let fail_on_existing = match lookup("ADDON_FAIL_ON_EXISTING") {
            Some(v) => v
                .parse()
                .with_context(|| format!("ADDON_FAIL_ON_EXISTING must be true or false, got {}", v))?,
            None => defaults.fail_on_existing,
        };
        Ok(Configuration {
            manager_cluster_role: lookup("ADDON_MANAGER_CLUSTER_ROLE")
                .unwrap_or(defaults.manager_cluster_role),
            fail_on_existing,
            job_settle_delay: seconds("ADDON_JOB_SETTLE_SECONDS", defaults.job_settle_delay)?,
            job_recreate_timeout: seconds(
                "ADDON_JOB_RECREATE_TIMEOUT_SECONDS",
                defaults.job_recreate_timeout,
            )?,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Install, scale, update and remove the per node pool ingress addon.
#[derive(clap::Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Clone, Debug)]
enum Command {
    /// Create the cluster-shared namespace, RBAC objects and config map
    InstallCommon,
    /// Delete the cluster-shared objects
    UninstallCommon,
    /// Create the deployments, services, webhook configuration and certificate jobs of a node pool
    InstallPool {
        #[clap(flatten)]
        pool: PoolArg,
        #[arg(long)]
        controller_image: String,
        /// Image of the admission webhook certificate jobs
        #[arg(long)]
        webhook_image: String,
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: i32,
        /// External IP of the controller service, may be repeated
        #[arg(long = "external-ip")]
        external_ips: Vec<String>,
        /// Let the controller deployment and webhook configuration be owned by the addon manager
        #[arg(long)]
        owned: bool,
    },
    /// Delete the objects of a node pool
    UninstallPool {
        #[clap(flatten)]
        pool: PoolArg,
        /// Delete the pods of the certificate jobs together with the jobs
        #[arg(long)]
        force_cleanup: bool,
    },
    /// Scale the controller deployment of a node pool
    Scale {
        #[clap(flatten)]
        pool: PoolArg,
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: i32,
    },
    /// Set replicas and image of the controller deployment and the image of the webhook deployment
    UpdateDeployment {
        #[clap(flatten)]
        pool: PoolArg,
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..))]
        replicas: i32,
        #[arg(long)]
        image: String,
    },
    /// Replace the external IPs of the controller service, none removes them
    UpdateExternalIps {
        #[clap(flatten)]
        pool: PoolArg,
        #[arg(long = "external-ip")]
        external_ips: Vec<String>,
    },
    /// Delete and recreate the admission webhook certificate jobs
    RecreateJobs {
        #[clap(flatten)]
        pool: PoolArg,
        #[arg(long)]
        image: String,
    },
    /// Print whether the addon namespace is active
    NamespaceReady,
    /// Print the manifest rendered from a template
    Render {
        template: String,
        /// Node pool of a pool-scoped template
        #[arg(long)]
        pool: Option<String>,
    },
}

#[derive(clap::Args, Clone, Debug)]
struct PoolArg {
    /// Name of the node pool, used as value of the nodepool_name label
    #[arg(long = "pool")]
    name: String,
}

fn render(template: &str, pool: Option<&str>) -> Result<String, AddonError> {
    let template = Template::from_id(template)?;
    let params = match (template.sharing(), pool) {
        (Sharing::Pool, Some(pool)) => PoolScope::new(pool).params(),
        (Sharing::Pool, None) => {
            return Err(RenderError::MissingParameter {
                template: template.id().to_string(),
                parameter: POOL_LABEL.to_string(),
            }
            .into());
        }
        (Sharing::Cluster, _) => TemplateParams::new(),
    };
    Ok(serde_json::to_string_pretty(&template.render(&params)?)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if let Command::Render { template, pool } = &cli.command {
        println!("{}", render(template, pool.as_deref())?);
        return Ok(());
    }
    let configuration = Configuration::from_env()?;
    debug!("configuration: {:?}", configuration);
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let client = Client::try_default().await?;
    let controller = IngressAddonController::new(KubeStore::new(client), configuration);
    let result = match cli.command {
        Command::InstallCommon => controller.install_common_resources().await,
        Command::UninstallCommon => controller.uninstall_common_resources().await,
        Command::InstallPool {
            pool,
            controller_image,
            webhook_image,
            replicas,
            external_ips,
            owned,
        } => {
            let owner = if owned {
                Some(controller.resolve_owner().await)
            } else {
                None
            };
            let install = PoolInstall {
                external_ips,
                controller_image,
                webhook_image,
                replicas,
                owner,
            };
            controller
                .install_pool_resources(pool.name.as_str(), &install)
                .await
        }
        Command::UninstallPool {
            pool,
            force_cleanup,
        } => {
            controller
                .uninstall_pool_resources(pool.name.as_str(), force_cleanup)
                .await
        }
        Command::Scale { pool, replicas } => {
            controller
                .scale_controller_deployment(pool.name.as_str(), replicas)
                .await
        }
        Command::UpdateDeployment {
            pool,
            replicas,
            image,
        } => {
            controller
                .update_controller_deployment(pool.name.as_str(), replicas, image.as_str())
                .await
        }
        Command::UpdateExternalIps { pool, external_ips } => {
            controller
                .update_service_external_ips(pool.name.as_str(), &external_ips)
                .await
        }
        Command::RecreateJobs { pool, image } => {
            controller
                .recreate_webhook_jobs(pool.name.as_str(), image.as_str())
                .await
        }
        Command::NamespaceReady => {
            println!("{}", controller.is_ingress_namespace_ready().await);
            return Ok(());
        }
        Command::Render { .. } => unreachable!("handled before connecting"),
    };
    match result {
        Ok(progress) => {
            info!("done, {}", progress);
            Ok(())
        }
        Err(e) => {
            if let Some(completed) = e.completed_steps() {
                error!(
                    "{} steps completed before the failure, nothing was rolled back",
                    completed
                );
            }
            if e.is_not_found() {
                error!("a referenced object does not exist, are the common resources installed?");
            }
            Err(e.into())
        }
    }
}
