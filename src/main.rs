//! capi-rollout - rolling in-place upgrades for Cluster API control planes

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capi_rollout::config::Config;
use capi_rollout::store::{create_client, KubeStore, ObjectStore};
use capi_rollout::target::{client_from_kubeconfig_secret, KubeTarget};
use capi_rollout::upgrade::ControlPlaneUpgrader;
use capi_rollout::{capi, Error};

/// Replace each control-plane machine of a CAPI cluster, one at a time, with
/// a machine running the desired Kubernetes version.
#[derive(Parser, Debug)]
#[command(name = "capi-rollout", version, about, long_about = None)]
struct Cli {
    /// Desired Kubernetes version (tolerant semver, e.g. "1.17.0" or "v1.17").
    /// Defaults to the highest version already on the control plane.
    #[arg(long)]
    kubernetes_version: Option<String>,

    /// Infrastructure spec field to override with --image-id on replacements
    #[arg(long, requires = "image_id")]
    image_field: Option<String>,

    /// Image identifier written into --image-field on replacements
    #[arg(long, requires = "image_field")]
    image_id: Option<String>,

    /// Upgrade id of a failed run to resume (digits only); defaults to the
    /// current Unix timestamp
    #[arg(long)]
    upgrade_id: Option<String>,

    /// Path to the management cluster kubeconfig
    #[arg(long, env = "KUBECONFIG")]
    management_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context for the management cluster
    #[arg(long)]
    management_context: Option<String>,

    /// Namespace of the Cluster object in the management cluster
    #[arg(long, default_value = "default")]
    cluster_namespace: String,

    /// Name of the Cluster object in the management cluster
    #[arg(long)]
    cluster_name: String,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            kubernetes_version: self.kubernetes_version,
            image_field: self.image_field,
            image_id: self.image_id,
            upgrade_id: self.upgrade_id,
            management_kubeconfig: self.management_kubeconfig,
            management_context: self.management_context,
            cluster_namespace: self.cluster_namespace,
            cluster_name: self.cluster_name,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config();

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Upgrade failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> capi_rollout::Result<()> {
    config.validate()?;

    let management_client = create_client(
        config.management_kubeconfig.as_deref(),
        config.management_context.as_deref(),
    )
    .await?;
    let store = Arc::new(KubeStore::new(management_client));

    tracing::info!(
        cluster_namespace = %config.cluster_namespace,
        cluster_name = %config.cluster_name,
        "Retrieving cluster from management cluster"
    );
    store
        .get(
            &capi::cluster_resource(),
            &config.cluster_namespace,
            &config.cluster_name,
        )
        .await
        .map_err(|e| match e {
            Error::Kube(kube::Error::Api(ae)) if ae.code == 404 => Error::not_found(format!(
                "cluster {}/{}",
                config.cluster_namespace, config.cluster_name
            )),
            other => other,
        })?;

    tracing::info!("Creating target kubernetes client");
    let target_client = client_from_kubeconfig_secret(
        store.as_ref(),
        &config.cluster_namespace,
        &config.cluster_name,
    )
    .await?;
    let target = Arc::new(KubeTarget::new(target_client));

    let mut upgrader = ControlPlaneUpgrader::new(store, target, &config)?;
    upgrader.upgrade().await
}
