//! Typed operations and pod exec against the target cluster
//!
//! The target cluster is the one being upgraded. Everything the tool needs
//! from it (nodes, control-plane pods, the kubeadm/kubelet configmaps, the
//! kubelet RBAC, and running `etcdctl` inside etcd pods) sits behind the
//! [`TargetCluster`] trait so tests can mock the cluster wholesale.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, AttachParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::store::ObjectStore;
use crate::{capi, Error, Result};

/// Output of a command executed inside a pod.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Whether the command exited successfully
    pub success: bool,
}

/// Operations the upgrade needs from the target cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Fetch a configmap; not-found yields `None`.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a configmap. AlreadyExists is swallowed.
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Replace a configmap.
    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;

    /// Fetch a role; not-found yields `None`.
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>>;

    /// Create a role. AlreadyExists is swallowed.
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<()>;

    /// Fetch a role binding; not-found yields `None`.
    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;

    /// Create a role binding. AlreadyExists is swallowed.
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()>;

    /// List every node in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch a pod; not-found yields `None`.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// List pods matching a label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Run a command inside a pod and collect its output and exit status.
    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput>;
}

/// Real target cluster backed by a Kubernetes client.
pub struct KubeTarget {
    client: Client,
}

impl KubeTarget {
    /// Create a target over the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = AsyncReadExt::read_to_end(&mut reader, &mut buf).await;
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn absent_on_404<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn swallow_conflict<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TargetCluster for KubeTarget {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        swallow_conflict(api.create(&PostParams::default(), config_map).await)
    }

    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        api.replace(name, &PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<()> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        swallow_conflict(api.create(&PostParams::default(), role).await)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        swallow_conflict(api.create(&PostParams::default(), binding).await)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn pod_exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdout(true).stderr(true);

        let exec = async {
            let mut attached = pods.exec(pod, command.iter().cloned(), &params).await?;

            let stdout_reader = attached.stdout();
            let stderr_reader = attached.stderr();

            let (stdout, stderr) =
                tokio::join!(read_stream(stdout_reader), read_stream(stderr_reader));

            // kubectl-style exit status arrives as a Status frame on the
            // error channel; absence of the frame means a clean exit.
            let success = match attached.take_status() {
                Some(status) => match status.await {
                    Some(status) => status.status.as_deref() == Some("Success"),
                    None => true,
                },
                None => true,
            };

            debug!(pod = %pod, success, "Pod exec finished");
            Ok::<_, Error>(ExecOutput {
                stdout,
                stderr,
                success,
            })
        };

        tokio::time::timeout(timeout, exec)
            .await
            .map_err(|_| Error::timeout(format!("running command in pod {}/{}", namespace, pod)))?
    }
}

/// Build a client for the target cluster from its kubeconfig secret.
///
/// The secret lives in the management cluster as `<clusterName>-kubeconfig`
/// with the kubeconfig under the `value` key.
pub async fn client_from_kubeconfig_secret(
    store: &dyn ObjectStore,
    namespace: &str,
    cluster_name: &str,
) -> Result<Client> {
    let secret_name = format!("{}-kubeconfig", cluster_name);
    let secret = store
        .get(&capi::secret_resource(), namespace, &secret_name)
        .await
        .map_err(|e| match e {
            Error::Kube(kube::Error::Api(ae)) if ae.code == 404 => Error::not_found(format!(
                "cluster kubeconfig secret {}/{}",
                namespace, secret_name
            )),
            other => other,
        })?;

    let encoded = secret
        .data
        .pointer("/data/value")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            Error::serialization(format!(
                "secret {}/{} has no 'value' key",
                namespace, secret_name
            ))
        })?;

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| Error::serialization(format!("kubeconfig secret is not base64: {}", e)))?;
    let yaml = String::from_utf8(decoded)
        .map_err(|e| Error::serialization(format!("kubeconfig secret is not UTF-8: {}", e)))?;

    let kubeconfig = Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::serialization(format!("invalid kubeconfig in secret: {}", e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::validation(format!("failed to load target kubeconfig: {}", e)))?;

    Ok(Client::try_from(config)?)
}
