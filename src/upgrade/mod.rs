//! The rolling replacement orchestrator
//!
//! [`ControlPlaneUpgrader::upgrade`] drives the whole run: list the
//! control-plane machines, resolve the desired version, prepare the kubeadm
//! and kubelet configmaps, then replace machines one at a time. Per machine
//! the order is load-bearing: infra created < bootstrap created < machine
//! created < provider id observed < node observed < node ready < old etcd
//! member removed < old machine deleted.
//!
//! Every step is idempotent against cluster state. Synthesized objects carry
//! the run's name suffix, machines in flight carry the upgrade-id annotation,
//! and each creation is guarded by an existence probe, so re-running with the
//! same upgrade id resumes a crashed run instead of forking it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use semver::Version;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::capi;
use crate::config::Config;
use crate::etcd::EtcdCtl;
use crate::kubeadm;
use crate::names::{replacement_name, upgrade_suffix};
use crate::nodes::{hostname_for_node, normalize_provider_id, NodeIndex};
use crate::store::{patch_with_base, ObjectStore};
use crate::target::TargetCluster;
use crate::version::{is_minor_bump, min_max_versions, parse_tolerant};
use crate::wait::poll_until;
use crate::{Error, Result};

/// Annotation recording which upgrade run owns a machine.
pub const ANNOTATION_UPGRADE_ID: &str = "upgrade.cluster-api.vmware.com/id";

const KUBE_SYSTEM: &str = "kube-system";
const ETCD_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const PROVIDER_ID_POLL: Duration = Duration::from_secs(5);
const NODE_POLL: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_secs(15);

const CONTROL_PLANE_COMPONENTS: [&str; 4] = [
    "etcd",
    "kube-apiserver",
    "kube-scheduler",
    "kube-controller-manager",
];
const REQUIRED_POD_CONDITIONS: [&str; 4] =
    ["PodScheduled", "Initialized", "Ready", "ContainersReady"];

/// Why a machine was passed over in the replacement loop.
#[derive(Debug, PartialEq, Eq)]
enum SkipReason {
    /// The machine is annotated with a different run's upgrade id.
    ForeignUpgradeId(String),
    /// The machine is itself a replacement created by this run.
    IsReplacement,
}

/// Decide whether an annotated machine should be skipped.
///
/// Called after the upgrade-id annotation has been ensured, so an absent or
/// mismatching annotation means another run owns the machine.
fn skip_reason(machine: &DynamicObject, upgrade_id: &str) -> Option<SkipReason> {
    let annotated = capi::annotation(machine, ANNOTATION_UPGRADE_ID).unwrap_or_default();
    if annotated != upgrade_id {
        return Some(SkipReason::ForeignUpgradeId(annotated.to_string()));
    }

    let name = machine.metadata.name.as_deref().unwrap_or_default();
    if name.ends_with(&upgrade_suffix(upgrade_id)) {
        return Some(SkipReason::IsReplacement);
    }

    None
}

/// Whether the pod carries every condition a healthy static pod reports.
fn pod_conditions_met(pod: &Pod) -> bool {
    let Some(conditions) = pod.status.as_ref().and_then(|status| status.conditions.as_ref())
    else {
        return false;
    };
    REQUIRED_POD_CONDITIONS.iter().all(|required| {
        conditions
            .iter()
            .any(|condition| condition.type_ == *required && condition.status == "True")
    })
}

/// Build the replacement infrastructure object from the original.
fn build_replacement_infra(
    original: &DynamicObject,
    name: &str,
    image: Option<(&str, &str)>,
) -> DynamicObject {
    let mut replacement = original.clone();
    capi::clear_server_fields(&mut replacement);
    replacement.metadata.owner_references = None;
    replacement.metadata.name = Some(name.to_string());
    capi::unset_data_field(&mut replacement, "/spec/providerID");

    if let Some((field, id)) = image {
        capi::set_data_field(&mut replacement, &format!("/spec/{}", field), json!(id));
    }

    replacement
}

/// Build the replacement bootstrap config from the original.
///
/// The copy always joins the existing control plane: node registration moves
/// into `joinConfiguration` and `initConfiguration` is dropped.
fn build_replacement_bootstrap(original: &DynamicObject, name: &str) -> DynamicObject {
    let mut replacement = original.clone();
    capi::clear_server_fields(&mut replacement);
    replacement.metadata.owner_references = None;
    replacement.metadata.name = Some(name.to_string());
    capi::migrate_init_to_join(&mut replacement);
    replacement
}

/// Build the replacement machine from the original.
fn build_replacement_machine(
    original: &DynamicObject,
    name: &str,
    desired: &Version,
) -> DynamicObject {
    let mut replacement = original.clone();
    capi::clear_server_fields(&mut replacement);
    replacement.metadata.name = Some(name.to_string());

    // The infrastructure controller assigns a fresh provider id; the
    // bootstrap controller regenerates the bootstrap data.
    capi::unset_data_field(&mut replacement, "/spec/providerID");
    capi::unset_data_field(&mut replacement, "/spec/bootstrap/data");

    capi::set_data_field(&mut replacement, "/spec/infrastructureRef/name", json!(name));
    capi::set_data_field(&mut replacement, "/spec/bootstrap/configRef/name", json!(name));
    capi::set_data_field(&mut replacement, "/spec/version", json!(desired.to_string()));

    replacement
}

/// Orchestrates one rolling control-plane upgrade run.
pub struct ControlPlaneUpgrader {
    store: Arc<dyn ObjectStore>,
    target: Arc<dyn TargetCluster>,
    etcd: EtcdCtl,
    nodes: NodeIndex,
    cluster_namespace: String,
    cluster_name: String,
    user_version: Option<Version>,
    image_field: Option<String>,
    image_id: Option<String>,
    upgrade_id: String,
    old_node_to_etcd_member: HashMap<String, String>,
    secrets_updated: bool,
}

impl ControlPlaneUpgrader {
    /// Validate the configuration and assemble an upgrader.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        target: Arc<dyn TargetCluster>,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;

        let user_version = config
            .kubernetes_version
            .as_deref()
            .map(parse_tolerant)
            .transpose()?;

        let upgrade_id = config.effective_upgrade_id();
        info!(
            upgrade_id = %upgrade_id,
            "Rerun with --upgrade-id={} if this upgrade fails midway and you want to retry",
            upgrade_id
        );

        Ok(Self {
            etcd: EtcdCtl::new(target.clone()),
            store,
            target,
            nodes: NodeIndex::new(),
            cluster_namespace: config.cluster_namespace.clone(),
            cluster_name: config.cluster_name.clone(),
            user_version,
            image_field: config.image_field.clone(),
            image_id: config.image_id.clone(),
            upgrade_id,
            old_node_to_etcd_member: HashMap::new(),
            secrets_updated: false,
        })
    }

    /// The id this run operates under.
    pub fn upgrade_id(&self) -> &str {
        &self.upgrade_id
    }

    /// Run the upgrade to completion.
    ///
    /// Safe to re-invoke with the same upgrade id after a crash; completed
    /// steps are detected from cluster state and skipped.
    pub async fn upgrade(&mut self) -> Result<()> {
        let machines = self.list_machines().await?;
        if machines.is_empty() {
            return Err(Error::not_found("control plane machines"));
        }

        let bounds = min_max_versions(
            machines
                .iter()
                .map(|m| (capi::namespaced_name(m), capi::machine_version(m))),
        )?;

        let desired = match (&self.user_version, &bounds) {
            (Some(user), _) => user.clone(),
            (None, Some((_, max))) => max.clone(),
            (None, None) => {
                return Err(Error::validation(
                    "no desired version: none supplied and no machine carries one",
                ))
            }
        };

        if let Some((min, _)) = &bounds {
            if is_minor_bump(min, &desired) {
                kubeadm::ensure_kubelet_config_map(self.target.as_ref(), &desired).await?;
                kubeadm::ensure_kubelet_rbac(self.target.as_ref(), &desired).await?;
            }
        }

        info!("Checking etcd health");
        self.etcd.health_check(ETCD_TIMEOUT).await?;

        info!("Updating provider IDs to nodes");
        self.nodes.refresh(self.target.as_ref()).await?;

        info!("Updating kubernetes version");
        kubeadm::update_kubernetes_version(self.target.as_ref(), &desired).await?;

        // Snapshot hostname -> member id before any replacement begins, so
        // old members stay addressable after their node is gone.
        self.old_node_to_etcd_member = self.etcd.member_ids_by_node(ETCD_TIMEOUT).await?;

        info!("Updating machines");
        let processed = self.replace_machines(&machines, &desired).await?;

        info!("Removing upgrade annotations");
        self.clear_upgrade_annotations(&processed).await
    }

    async fn list_machines(&self) -> Result<Vec<DynamicObject>> {
        let selector = format!(
            "{}={},{}=true",
            capi::LABEL_CLUSTER_NAME,
            self.cluster_name,
            capi::LABEL_CONTROL_PLANE
        );
        info!(label_selector = %selector, "Listing machines");

        let machines = self
            .store
            .list(
                &capi::machine_resource(),
                &self.cluster_namespace,
                Some(&selector),
            )
            .await?;

        Ok(machines
            .into_iter()
            .filter(|machine| !capi::has_deletion_timestamp(machine))
            .collect())
    }

    /// Replace each machine in turn, returning the replacement names of the
    /// machines this run actually processed.
    async fn replace_machines(
        &mut self,
        machines: &[DynamicObject],
        desired: &Version,
    ) -> Result<Vec<String>> {
        let mut processed = Vec::new();

        for machine in machines {
            let machine_id = capi::namespaced_name(machine);

            if capi::machine_provider_id(machine).is_none() {
                warn!(machine = %machine_id, "Unable to upgrade machine as it has no spec.providerID");
                continue;
            }

            let Some(machine) = self.ensure_upgrade_annotation(machine).await? else {
                continue;
            };

            match skip_reason(&machine, &self.upgrade_id) {
                Some(SkipReason::ForeignUpgradeId(foreign)) => {
                    info!(
                        machine = %machine_id,
                        machine_upgrade_id = %foreign,
                        "Unable to upgrade machine - mismatching upgrade id"
                    );
                    continue;
                }
                Some(SkipReason::IsReplacement) => {
                    info!(
                        machine = %machine_id,
                        "Skipping machine as it is a replacement machine for the in-process upgrade"
                    );
                    // Still finalized at the end of the run: a resumed run
                    // must clear the annotation its predecessor left behind.
                    processed.push(
                        machine.metadata.name.clone().unwrap_or_default(),
                    );
                    continue;
                }
                None => {}
            }

            let original_name = machine.metadata.name.as_deref().unwrap_or_default();
            let replacement = replacement_name(original_name, &self.upgrade_id);

            self.ensure_replacement_infra(&replacement, &machine).await?;
            self.ensure_replacement_bootstrap(&replacement, &machine).await?;
            self.replace_machine(&replacement, &machine, desired).await?;

            processed.push(replacement);
        }

        Ok(processed)
    }

    /// Stamp the machine with this run's upgrade id if it has none.
    ///
    /// Returns the (possibly updated) machine, or `None` when the annotation
    /// patch failed and the machine should be skipped this round.
    async fn ensure_upgrade_annotation(
        &self,
        machine: &DynamicObject,
    ) -> Result<Option<DynamicObject>> {
        let current = capi::annotation(machine, ANNOTATION_UPGRADE_ID).unwrap_or_default();
        if !current.is_empty() {
            return Ok(Some(machine.clone()));
        }

        let mut updated = machine.clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_UPGRADE_ID.to_string(), self.upgrade_id.clone());

        info!(machine = %capi::namespaced_name(machine), "Storing upgrade ID on machine");
        match patch_with_base(
            self.store.as_ref(),
            &capi::machine_resource(),
            machine,
            &updated,
        )
        .await
        {
            Ok(()) => Ok(Some(updated)),
            Err(e) => {
                error!(
                    machine = %capi::namespaced_name(machine),
                    error = %e,
                    "Error patching machine (add upgrade id)"
                );
                Ok(None)
            }
        }
    }

    async fn ensure_replacement_infra(
        &self,
        replacement: &str,
        machine: &DynamicObject,
    ) -> Result<()> {
        let infra_ref = capi::infrastructure_ref(machine)?;
        let ar = capi::resource_for_ref(&infra_ref);

        info!(
            api_version = %infra_ref.api_version,
            kind = %infra_ref.kind,
            name = %infra_ref.name,
            "Updating infrastructure reference"
        );

        if self
            .store
            .exists(&ar, &self.cluster_namespace, replacement)
            .await?
        {
            return Ok(());
        }

        let original = self
            .store
            .get(&ar, &self.cluster_namespace, &infra_ref.name)
            .await?;

        let image = match (&self.image_field, &self.image_id) {
            (Some(field), Some(id)) => Some((field.as_str(), id.as_str())),
            _ => None,
        };
        let obj = build_replacement_infra(&original, replacement, image);

        self.store
            .create(&ar, &self.cluster_namespace, &obj)
            .await?;
        Ok(())
    }

    async fn ensure_replacement_bootstrap(
        &mut self,
        replacement: &str,
        machine: &DynamicObject,
    ) -> Result<()> {
        let config_ref = capi::bootstrap_config_ref(machine)?;
        let ar = capi::kubeadm_config_resource();

        info!(
            api_version = %config_ref.api_version,
            kind = %config_ref.kind,
            name = %config_ref.name,
            "Updating bootstrap reference"
        );

        if self
            .store
            .exists(&ar, &self.cluster_namespace, replacement)
            .await?
        {
            return Ok(());
        }

        let original = self
            .store
            .get(&ar, &self.cluster_namespace, &config_ref.name)
            .await?;
        let obj = build_replacement_bootstrap(&original, replacement);

        let created = self
            .store
            .create(&ar, &self.cluster_namespace, &obj)
            .await?;

        if !self.secrets_updated {
            self.reparent_pki_secrets(&created).await?;
            self.secrets_updated = true;
        }

        Ok(())
    }

    /// Point the cluster's PKI secrets at the first replacement bootstrap
    /// config so the target cluster's garbage collector keeps them alive.
    async fn reparent_pki_secrets(&self, bootstrap: &DynamicObject) -> Result<()> {
        let owner = OwnerReference {
            api_version: capi::BOOTSTRAP_API_VERSION.to_string(),
            kind: "KubeadmConfig".to_string(),
            name: bootstrap.metadata.name.clone().unwrap_or_default(),
            uid: bootstrap.metadata.uid.clone().unwrap_or_default(),
            ..Default::default()
        };

        for suffix in ["ca", "etcd", "sa", "proxy"] {
            let secret_name = format!("{}-{}", self.cluster_name, suffix);
            let base = self
                .store
                .get(
                    &capi::secret_resource(),
                    &self.cluster_namespace,
                    &secret_name,
                )
                .await?;

            let mut updated = base.clone();
            updated.metadata.owner_references = Some(vec![owner.clone()]);

            info!(secret = %secret_name, "Reparenting cluster PKI secret");
            patch_with_base(
                self.store.as_ref(),
                &capi::secret_resource(),
                &base,
                &updated,
            )
            .await?;
        }

        Ok(())
    }

    async fn ensure_replacement_machine(
        &self,
        replacement: &str,
        machine: &DynamicObject,
        desired: &Version,
    ) -> Result<()> {
        let ar = capi::machine_resource();
        if self
            .store
            .exists(&ar, &self.cluster_namespace, replacement)
            .await?
        {
            info!(machine = %replacement, "New machine exists - nothing to create");
            return Ok(());
        }

        info!(machine = %replacement, "Creating new machine");
        let obj = build_replacement_machine(machine, replacement, desired);
        self.store
            .create(&ar, &self.cluster_namespace, &obj)
            .await?;
        info!(machine = %replacement, "Create succeeded");
        Ok(())
    }

    /// Replace one machine: create its successor, wait for the successor to
    /// become a healthy control-plane node, then evict the old etcd member
    /// and delete the old machine.
    async fn replace_machine(
        &mut self,
        replacement: &str,
        machine: &DynamicObject,
        desired: &Version,
    ) -> Result<()> {
        let machine_id = capi::namespaced_name(machine);

        let raw_provider_id = capi::machine_provider_id(machine).ok_or_else(|| {
            Error::validation(format!("machine {} has no spec.providerID", machine_id))
        })?;
        let original_provider_id = normalize_provider_id(&raw_provider_id);
        debug!(machine = %machine_id, provider_id = %original_provider_id, "Determined provider id for machine");

        let old_node = self
            .nodes
            .lookup(&original_provider_id)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("node for provider id {:?}", raw_provider_id))
            })?;
        let old_hostname = hostname_for_node(&old_node).unwrap_or_default();
        debug!(
            machine = %machine_id,
            node = old_node.metadata.name.as_deref().unwrap_or_default(),
            hostname = %old_hostname,
            "Determined node hostname for machine"
        );

        self.ensure_replacement_machine(replacement, machine, desired)
            .await?;

        let new_provider_id = self.wait_for_provider_id(replacement).await?;
        let node = self.wait_for_matching_node(&new_provider_id).await?;
        self.wait_for_node_ready(&node).await?;

        self.nodes.refresh(self.target.as_ref()).await?;

        if let Some(member_id) = self.old_node_to_etcd_member.get(&old_hostname).cloned() {
            if !member_id.is_empty() {
                self.etcd
                    .remove_member(ETCD_TIMEOUT, &member_id)
                    .await
                    .map_err(|e| {
                        Error::etcd(format!(
                            "unable to delete old etcd member {}: {}",
                            member_id, e
                        ))
                    })?;
            }
        }

        info!(machine = %machine_id, "Deleting existing machine");
        let name = machine.metadata.name.as_deref().unwrap_or_default();
        self.store
            .delete(&capi::machine_resource(), &self.cluster_namespace, name)
            .await?;

        Ok(())
    }

    async fn wait_for_provider_id(&self, name: &str) -> Result<String> {
        info!(machine = %name, "Waiting for machine to have a provider id");

        let store = self.store.clone();
        let namespace = self.cluster_namespace.clone();
        let machine_name = name.to_string();

        poll_until(
            "waiting for machine provider id",
            PROVIDER_ID_POLL,
            WAIT_TIMEOUT,
            move || {
                let store = store.clone();
                let namespace = namespace.clone();
                let machine_name = machine_name.clone();
                async move {
                    let machine = match store
                        .get(&capi::machine_resource(), &namespace, &machine_name)
                        .await
                    {
                        Ok(machine) => machine,
                        Err(e) => {
                            warn!(machine = %machine_name, error = %e, "Error getting machine, will try again");
                            return Ok(None);
                        }
                    };

                    match capi::machine_provider_id(&machine) {
                        Some(id) if !id.is_empty() => {
                            info!(machine = %machine_name, provider_id = %id, "Got provider id");
                            Ok(Some(id))
                        }
                        _ => Ok(None),
                    }
                }
            },
        )
        .await
    }

    async fn wait_for_matching_node(&self, raw_provider_id: &str) -> Result<Node> {
        info!(provider_id = %raw_provider_id, "Waiting for node");

        let wanted = normalize_provider_id(raw_provider_id);
        let target = self.target.clone();

        poll_until("waiting for matching node", NODE_POLL, WAIT_TIMEOUT, move || {
            let target = target.clone();
            let wanted = wanted.clone();
            async move {
                let nodes = match target.list_nodes().await {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        warn!(error = %e, "Error listing nodes in target cluster, will try again");
                        return Ok(None);
                    }
                };

                for node in nodes {
                    let node_id = node
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.provider_id.as_deref())
                        .map(normalize_provider_id);
                    if node_id.as_deref() == Some(wanted.as_str()) {
                        info!(
                            node = node.metadata.name.as_deref().unwrap_or_default(),
                            "Found node"
                        );
                        return Ok(Some(node));
                    }
                }
                Ok(None)
            }
        })
        .await
    }

    async fn wait_for_node_ready(&self, node: &Node) -> Result<()> {
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        let hostname = hostname_for_node(node).ok_or_else(|| {
            Error::validation(format!("unable to find hostname for node {}", node_name))
        })?;

        let target = self.target.clone();
        poll_until(
            "waiting for control plane components to be ready",
            READY_POLL,
            WAIT_TIMEOUT,
            move || {
                let target = target.clone();
                let hostname = hostname.clone();
                async move {
                    debug!(hostname = %hostname, "Component health check for node");
                    Ok(node_components_ready(target.as_ref(), &hostname)
                        .await
                        .then_some(()))
                }
            },
        )
        .await
    }

    /// Drop the upgrade-id annotation from every replacement machine this
    /// run processed.
    async fn clear_upgrade_annotations(&self, replacements: &[String]) -> Result<()> {
        for name in replacements {
            let base = self
                .store
                .get(&capi::machine_resource(), &self.cluster_namespace, name)
                .await?;

            let mut updated = base.clone();
            if let Some(annotations) = updated.metadata.annotations.as_mut() {
                annotations.remove(ANNOTATION_UPGRADE_ID);
            }

            patch_with_base(
                self.store.as_ref(),
                &capi::machine_resource(),
                &base,
                &updated,
            )
            .await?;
        }
        Ok(())
    }
}

/// Whether every control-plane component pod on the node is fully ready.
async fn node_components_ready(target: &dyn TargetCluster, hostname: &str) -> bool {
    for component in CONTROL_PLANE_COMPONENTS {
        let pod_name = format!("{}-{}", component, hostname);

        match target.get_pod(KUBE_SYSTEM, &pod_name).await {
            Ok(Some(pod)) if pod_conditions_met(&pod) => {}
            Ok(Some(_)) => {
                debug!(pod = %pod_name, "Pod is missing some required conditions");
                return false;
            }
            Ok(None) => {
                debug!(pod = %pod_name, "Pod not found yet");
                return false;
            }
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Error getting pod");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests;
