//! Kubeadm and kubelet configmap maintenance on the target cluster
//!
//! New control-plane nodes join with kubeadm, which reads the cluster's
//! desired Kubernetes version from `kube-system/kubeadm-config` and the
//! per-minor kubelet configuration from `kubelet-config-<major>.<minor>`.
//! Before any machine is replaced the version in the kubeadm configmap is
//! bumped, and on a minor-version upgrade the next minor's kubelet configmap
//! and its read RBAC are synthesized from the previous minor's.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use semver::Version;
use tracing::info;

use crate::target::TargetCluster;
use crate::{Error, Result};

const KUBE_SYSTEM: &str = "kube-system";
const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
const CLUSTER_CONFIGURATION_KEY: &str = "ClusterConfiguration";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Name of the kubelet configmap for a minor version, `kubelet-config-M.N`.
pub fn kubelet_config_map_name(version: &Version) -> String {
    format!("kubelet-config-{}.{}", version.major, version.minor)
}

/// Name of the kubelet config Role/RoleBinding for a minor version.
pub fn kubelet_rbac_name(version: &Version) -> String {
    format!("kubeadm:kubelet-config-{}.{}", version.major, version.minor)
}

/// Return a copy of the kubeadm configmap with `kubernetesVersion` replaced.
///
/// `data.ClusterConfiguration` is treated as a schema-free YAML mapping so
/// every other key round-trips unchanged.
pub fn set_cluster_configuration_version(
    config_map: &ConfigMap,
    version: &str,
) -> Result<ConfigMap> {
    let mut updated = config_map.clone();

    let data = updated
        .data
        .as_mut()
        .and_then(|data| data.get_mut(CLUSTER_CONFIGURATION_KEY))
        .ok_or_else(|| {
            Error::serialization(format!(
                "kubeadm configmap has no {} key",
                CLUSTER_CONFIGURATION_KEY
            ))
        })?;

    let mut cluster_config: serde_yaml::Mapping = serde_yaml::from_str(data).map_err(|e| {
        Error::serialization(format!("error decoding {}: {}", CLUSTER_CONFIGURATION_KEY, e))
    })?;
    cluster_config.insert(
        serde_yaml::Value::from("kubernetesVersion"),
        serde_yaml::Value::from(version),
    );

    *data = serde_yaml::to_string(&cluster_config).map_err(|e| {
        Error::serialization(format!("error encoding {}: {}", CLUSTER_CONFIGURATION_KEY, e))
    })?;

    Ok(updated)
}

/// Update the Kubernetes version stored in the kubeadm configmap.
///
/// Machines joining the control plane read this version; it must be bumped
/// before the first replacement is created.
pub async fn update_kubernetes_version(
    target: &dyn TargetCluster,
    desired: &Version,
) -> Result<()> {
    let config_map = target
        .get_config_map(KUBE_SYSTEM, KUBEADM_CONFIG_MAP)
        .await?
        .ok_or_else(|| {
            Error::not_found(format!("configmap {}/{}", KUBE_SYSTEM, KUBEADM_CONFIG_MAP))
        })?;

    let versioned = format!("v{}", desired);
    info!(version = %versioned, "Updating kubernetesVersion in kubeadm configmap");

    let updated = set_cluster_configuration_version(&config_map, &versioned)?;
    target.update_config_map(KUBE_SYSTEM, &updated).await
}

/// Ensure the kubelet configmap for the desired minor version exists.
///
/// No-op when it already exists. Otherwise the previous minor's configmap is
/// copied under the new name; its absence is fatal since kubeadm could not
/// configure kubelets on the new nodes.
pub async fn ensure_kubelet_config_map(
    target: &dyn TargetCluster,
    desired: &Version,
) -> Result<()> {
    let desired_name = kubelet_config_map_name(desired);
    if target
        .get_config_map(KUBE_SYSTEM, &desired_name)
        .await?
        .is_some()
    {
        info!(configmap = %desired_name, "Kubelet configmap already exists");
        return Ok(());
    }

    if desired.minor == 0 {
        return Err(Error::validation(format!(
            "cannot derive a previous kubelet configmap for version {}",
            desired
        )));
    }

    let previous = Version::new(desired.major, desired.minor - 1, 0);
    let previous_name = kubelet_config_map_name(&previous);
    let mut config_map = target
        .get_config_map(KUBE_SYSTEM, &previous_name)
        .await?
        .ok_or_else(|| {
            Error::not_found(format!("current kubelet configmap {}", previous_name))
        })?;

    config_map.metadata.name = Some(desired_name.clone());
    config_map.metadata.resource_version = None;
    config_map.metadata.uid = None;
    config_map.metadata.creation_timestamp = None;
    config_map.metadata.managed_fields = None;

    info!(from = %previous_name, to = %desired_name, "Creating kubelet configmap");
    target.create_config_map(KUBE_SYSTEM, &config_map).await
}

fn build_kubelet_role(version: &Version) -> Role {
    Role {
        metadata: kube::core::ObjectMeta {
            namespace: Some(KUBE_SYSTEM.to_string()),
            name: Some(kubelet_rbac_name(version)),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            verbs: vec!["get".to_string()],
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["configmaps".to_string()]),
            resource_names: Some(vec![kubelet_config_map_name(version)]),
            ..Default::default()
        }]),
    }
}

fn build_kubelet_role_binding(version: &Version) -> RoleBinding {
    let name = kubelet_rbac_name(version);
    RoleBinding {
        metadata: kube::core::ObjectMeta {
            namespace: Some(KUBE_SYSTEM.to_string()),
            name: Some(name.clone()),
            ..Default::default()
        },
        subjects: Some(vec![
            Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "Group".to_string(),
                name: "system:nodes".to_string(),
                ..Default::default()
            },
            Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "Group".to_string(),
                name: "system:bootstrappers:kubeadm:default-node-token".to_string(),
                ..Default::default()
            },
        ]),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name,
        },
    }
}

/// Ensure the Role and RoleBinding granting kubelets read access to the
/// desired minor's kubelet configmap.
pub async fn ensure_kubelet_rbac(target: &dyn TargetCluster, desired: &Version) -> Result<()> {
    let name = kubelet_rbac_name(desired);

    if target.get_role(KUBE_SYSTEM, &name).await?.is_none() {
        info!(role = %name, "Creating kubelet config role");
        target
            .create_role(KUBE_SYSTEM, &build_kubelet_role(desired))
            .await?;
    }

    if target.get_role_binding(KUBE_SYSTEM, &name).await?.is_none() {
        info!(role_binding = %name, "Creating kubelet config role binding");
        target
            .create_role_binding(KUBE_SYSTEM, &build_kubelet_role_binding(desired))
            .await?;
    }

    Ok(())
}
