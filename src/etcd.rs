//! Etcd membership and health via in-pod `etcdctl`
//!
//! The embedded etcd cluster has no reachable client endpoint from outside
//! the target cluster, so every operation runs `etcdctl` inside one of the
//! etcd pods (label `component=etcd` in `kube-system`), addressing the local
//! peer through its pod IP. Pods are tried in list order and the first
//! success wins, which rides out the window where a just-replaced node's
//! etcd pod is still converging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::target::{ExecOutput, TargetCluster};
use crate::{Error, Result};

const ETCD_CA_CERT: &str = "/etc/kubernetes/pki/etcd/ca.crt";
const ETCD_PEER_CERT: &str = "/etc/kubernetes/pki/etcd/peer.crt";
const ETCD_PEER_KEY: &str = "/etc/kubernetes/pki/etcd/peer.key";
const ETCD_POD_SELECTOR: &str = "component=etcd";
const KUBE_SYSTEM: &str = "kube-system";

/// One member of the etcd cluster, as reported by `member list -w json`.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdMember {
    /// Opaque member id
    #[serde(rename = "ID")]
    pub id: u64,
    /// Member name; kubeadm names members after the node's hostname
    #[serde(default)]
    pub name: String,
    /// Client endpoint URLs
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<EtcdMember>,
}

/// Format a member id the way `etcdctl member remove` expects it.
pub fn member_id_hex(id: u64) -> String {
    format!("{:x}", id)
}

fn parse_member_list(stdout: &str) -> Result<Vec<EtcdMember>> {
    let response: MemberListResponse = serde_json::from_str(stdout)
        .map_err(|e| Error::etcd(format!("unable to parse member list output: {}", e)))?;
    Ok(response.members)
}

/// Build the in-pod command line for one `etcdctl` invocation.
///
/// Everything is joined into a single `sh -c` string; caller arguments
/// appear exactly once, each as its own token in the joined command.
fn etcdctl_command(endpoint: &str, args: &[&str]) -> Vec<String> {
    let mut joined = vec![
        "ETCDCTL_API=3".to_string(),
        "etcdctl".to_string(),
        "--cacert".to_string(),
        ETCD_CA_CERT.to_string(),
        "--cert".to_string(),
        ETCD_PEER_CERT.to_string(),
        "--key".to_string(),
        ETCD_PEER_KEY.to_string(),
        "--endpoints".to_string(),
        endpoint.to_string(),
    ];
    joined.extend(args.iter().map(|arg| (*arg).to_string()));

    vec!["sh".to_string(), "-c".to_string(), joined.join(" ")]
}

/// Etcd cluster operations executed through the target cluster's etcd pods.
pub struct EtcdCtl {
    target: Arc<dyn TargetCluster>,
}

impl EtcdCtl {
    /// Create an etcd controller over the given target cluster.
    pub fn new(target: Arc<dyn TargetCluster>) -> Self {
        Self { target }
    }

    /// List the current etcd members.
    pub async fn list_members(&self, timeout: Duration) -> Result<Vec<EtcdMember>> {
        let output = self
            .etcdctl(timeout, &["member", "list", "-w", "json"])
            .await?;
        parse_member_list(&output.stdout)
    }

    /// Check the health of every member endpoint.
    ///
    /// Fails when any endpoint reports unhealthy; the orchestrator refuses
    /// to start replacing machines on an unhealthy cluster.
    pub async fn health_check(&self, timeout: Duration) -> Result<()> {
        let members = self.list_members(timeout).await?;
        let endpoints: Vec<String> = members
            .iter()
            .flat_map(|member| member.client_urls.iter().cloned())
            .collect();
        let joined = endpoints.join(",");

        info!(endpoints = %joined, "Checking etcd endpoint health");
        self.etcdctl(timeout, &["endpoint", "health", "--endpoints", &joined])
            .await?;
        Ok(())
    }

    /// Remove the member with the given hex id from the cluster.
    pub async fn remove_member(&self, timeout: Duration, member_id_hex: &str) -> Result<()> {
        info!(member = %member_id_hex, "Removing etcd member");
        self.etcdctl(timeout, &["member", "remove", member_id_hex])
            .await?;
        Ok(())
    }

    /// Snapshot the mapping from member name (node hostname) to hex id.
    ///
    /// Taken before any replacement begins so old members remain addressable
    /// after their node is gone.
    pub async fn member_ids_by_node(&self, timeout: Duration) -> Result<HashMap<String, String>> {
        let members = self.list_members(timeout).await?;
        Ok(members
            .into_iter()
            .map(|member| (member.name, member_id_hex(member.id)))
            .collect())
    }

    /// Run one etcdctl invocation, fanning out over the etcd pods.
    async fn etcdctl(&self, timeout: Duration, args: &[&str]) -> Result<ExecOutput> {
        let fan_out = async {
            let pods = self.target.list_pods(KUBE_SYSTEM, ETCD_POD_SELECTOR).await?;
            if pods.is_empty() {
                return Err(Error::etcd("found 0 etcd pods"));
            }

            let mut last_error = Error::etcd("no etcd pod could run etcdctl");
            for pod in &pods {
                let name = pod.metadata.name.as_deref().unwrap_or_default();
                let Some(ip) = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.pod_ip.as_deref())
                    .filter(|ip| !ip.is_empty())
                else {
                    last_error = Error::etcd(format!("etcd pod {} has no IP yet", name));
                    continue;
                };

                let endpoint = format!("https://{}:2379", ip);
                let command = etcdctl_command(&endpoint, args);
                debug!(pod = %name, args = %args.join(" "), "Running etcdctl");

                match self
                    .target
                    .pod_exec(KUBE_SYSTEM, name, &command, timeout)
                    .await
                {
                    Ok(output) if output.success => return Ok(output),
                    Ok(output) => {
                        debug!(pod = %name, stderr = %output.stderr.trim(), "etcdctl failed in pod");
                        last_error = Error::etcd(format!(
                            "etcdctl {} failed in pod {}: {}",
                            args.join(" "),
                            name,
                            output.stderr.trim()
                        ));
                    }
                    Err(e) => {
                        debug!(pod = %name, error = %e, "etcdctl exec error");
                        last_error = e;
                    }
                }
            }

            Err(last_error)
        };

        tokio::time::timeout(timeout, fan_out)
            .await
            .map_err(|_| Error::timeout(format!("running etcdctl {}", args.join(" "))))?
    }
}
