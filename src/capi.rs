//! Accessors over dynamic Cluster API objects
//!
//! Management-cluster objects (Machine, KubeadmConfig, provider-specific
//! infrastructure objects) are handled as [`DynamicObject`] so unknown fields
//! round-trip untouched. This module concentrates the typed access into those
//! objects: resource definitions, reference parsing, and the field surgery
//! needed to turn an existing object into a create-able replacement.

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use crate::{Error, Result};

/// API version of the core Cluster API group.
pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// API version of the kubeadm bootstrap provider group.
pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";

/// Label carrying the owning cluster's name on a Machine.
pub const LABEL_CLUSTER_NAME: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control-plane Machines.
pub const LABEL_CONTROL_PLANE: &str = "cluster.x-k8s.io/control-plane";

/// A reference to another object, as embedded in a Machine spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// apiVersion of the referenced object
    pub api_version: String,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
}

/// The `ApiResource` for CAPI Machines.
pub fn machine_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Machine"),
        "machines",
    )
}

/// The `ApiResource` for CAPI Clusters.
pub fn cluster_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Cluster"),
        "clusters",
    )
}

/// The `ApiResource` for kubeadm bootstrap configs.
pub fn kubeadm_config_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("bootstrap.cluster.x-k8s.io", "v1beta1", "KubeadmConfig"),
        "kubeadmconfigs",
    )
}

/// The `ApiResource` for core Secrets.
pub fn secret_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Secret"), "secrets")
}

/// Build an `ApiResource` for an arbitrary referenced object.
///
/// Infrastructure objects are schema-opaque; their group/version/kind come
/// verbatim from the Machine's `spec.infrastructureRef`.
pub fn resource_for_ref(object_ref: &ObjectRef) -> ApiResource {
    let (group, version) = match object_ref.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", object_ref.api_version.as_str()),
    };
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(group, version, &object_ref.kind),
        &pluralize_kind(&object_ref.kind),
    )
}

/// Convert a Kind to its plural resource name.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// `namespace/name` of an object, for log and error messages.
pub fn namespaced_name(obj: &DynamicObject) -> String {
    format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

/// The machine's `spec.version`, distinguishing nil from empty.
///
/// `None` means the field is absent or JSON null; the caller treats that as
/// fatal during version resolution, while an empty string is merely skipped.
pub fn machine_version(machine: &DynamicObject) -> Option<String> {
    machine
        .data
        .pointer("/spec/version")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The machine's `spec.providerID`, if set.
pub fn machine_provider_id(machine: &DynamicObject) -> Option<String> {
    machine
        .data
        .pointer("/spec/providerID")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The machine's `spec.infrastructureRef`.
pub fn infrastructure_ref(machine: &DynamicObject) -> Result<ObjectRef> {
    parse_ref(machine, "/spec/infrastructureRef")
}

/// The machine's `spec.bootstrap.configRef`.
pub fn bootstrap_config_ref(machine: &DynamicObject) -> Result<ObjectRef> {
    parse_ref(machine, "/spec/bootstrap/configRef")
}

fn parse_ref(machine: &DynamicObject, pointer: &str) -> Result<ObjectRef> {
    let raw = machine.data.pointer(pointer).ok_or_else(|| {
        Error::serialization(format!(
            "machine {} has no {}",
            namespaced_name(machine),
            pointer
        ))
    })?;

    let field = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::serialization(format!(
                    "machine {}: {} is missing {}",
                    namespaced_name(machine),
                    pointer,
                    key
                ))
            })
    };

    Ok(ObjectRef {
        api_version: field("apiVersion")?,
        kind: field("kind")?,
        name: field("name")?,
    })
}

/// The value of an annotation, if present.
pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Whether the object has a deletion timestamp set.
pub fn has_deletion_timestamp(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Clear the fields the API server owns so the object can be created anew.
pub fn clear_server_fields(obj: &mut DynamicObject) {
    obj.metadata.resource_version = None;
    obj.metadata.uid = None;
    obj.metadata.creation_timestamp = None;
    obj.metadata.managed_fields = None;
}

/// Set a nested field under the object's data.
pub fn set_data_field(obj: &mut DynamicObject, pointer: &str, value: Value) {
    set_pointer(&mut obj.data, pointer, value);
}

/// Remove a nested field under the object's data, if present.
pub fn unset_data_field(obj: &mut DynamicObject, pointer: &str) {
    let Some((parent, key)) = pointer.rsplit_once('/') else {
        return;
    };
    let parent = if parent.is_empty() {
        Some(&mut obj.data)
    } else {
        obj.data.pointer_mut(parent)
    };
    if let Some(Value::Object(map)) = parent {
        map.remove(key);
    }
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let mut current = root;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = json!({});
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| json!({}));
    }
}

/// Migrate a KubeadmConfig so the replacement always joins the control plane.
///
/// kubeadm prefers `initConfiguration` over `joinConfiguration` when both are
/// present, and a replacement node never initializes a new cluster. The node
/// registration is carried over from whichever section held it, a
/// `joinConfiguration` skeleton is created when missing, and
/// `initConfiguration` is dropped.
pub fn migrate_init_to_join(bootstrap: &mut DynamicObject) {
    let node_registration = bootstrap
        .data
        .pointer("/spec/initConfiguration/nodeRegistration")
        .or_else(|| bootstrap.data.pointer("/spec/joinConfiguration/nodeRegistration"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    if bootstrap.data.pointer("/spec/joinConfiguration").is_none() {
        set_data_field(
            bootstrap,
            "/spec/joinConfiguration",
            json!({ "controlPlane": {} }),
        );
    }
    set_data_field(
        bootstrap,
        "/spec/joinConfiguration/nodeRegistration",
        node_registration,
    );
    unset_data_field(bootstrap, "/spec/initConfiguration");
}
