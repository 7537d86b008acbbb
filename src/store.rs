//! Dynamic object CRUD against the management cluster
//!
//! All management-cluster access goes through the [`ObjectStore`] trait so
//! tests can mock the declarative store. The real implementation wraps a
//! [`kube::Client`] with [`Api<DynamicObject>`] handles per resource.
//!
//! Mutations on objects that other controllers also touch use
//! [`patch_with_base`]: deep-copy the object, mutate the copy, and send a
//! minimized JSON merge patch carrying the base's `resourceVersion` so a
//! concurrent writer surfaces as a conflict instead of being overwritten.

use std::path::Path;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// Typed CRUD plus an existence probe over declarative objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object.
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// List objects in a namespace, optionally filtered by label selector.
    async fn list<'a>(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: Option<&'a str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object.
    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object.
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    /// Apply a JSON merge patch to an object.
    async fn patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        body: &Value,
    ) -> Result<DynamicObject>;

    /// Whether the object exists. Not-found yields `false`; any other error
    /// propagates.
    async fn exists(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<bool>;
}

/// Real object store backed by a Kubernetes client.
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store over the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<DynamicObject> {
        Ok(self.api(ar, namespace).get(name).await?)
    }

    async fn list<'a>(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: Option<&'a str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.api(ar, namespace).list(&params).await?.items)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(ar, namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        self.api(ar, namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
        body: &Value,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(ar, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(body))
            .await?)
    }

    async fn exists(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self.api(ar, namespace).get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create a kube client from an optional kubeconfig path and context.
pub async fn create_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..KubeConfigOptions::default()
    };

    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::validation(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::validation(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::validation(format!("failed to load kubeconfig: {}", e)))?,
    };

    Ok(Client::try_from(config)?)
}

/// Compute a minimized JSON merge patch turning `before` into `after`.
///
/// Unchanged fields are omitted; fields removed in `after` become explicit
/// nulls. Arrays and scalars are replaced wholesale when they differ.
pub fn merge_patch(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for (key, after_value) in a {
                match b.get(key) {
                    Some(before_value) if before_value == after_value => {}
                    Some(before_value) => {
                        patch.insert(key.clone(), merge_patch(before_value, after_value));
                    }
                    None => {
                        patch.insert(key.clone(), after_value.clone());
                    }
                }
            }
            for key in b.keys() {
                if !a.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => after.clone(),
    }
}

/// Build the optimistic patch body for a mutated copy of `base`.
///
/// Returns `None` when nothing changed. Otherwise the minimized merge patch
/// additionally carries the base's `metadata.resourceVersion`, turning a lost
/// race into an API conflict.
pub fn optimistic_patch_body(
    base: &DynamicObject,
    updated: &DynamicObject,
) -> Result<Option<Value>> {
    let before = serde_json::to_value(base).map_err(|e| Error::serialization(e.to_string()))?;
    let after = serde_json::to_value(updated).map_err(|e| Error::serialization(e.to_string()))?;

    let mut patch = merge_patch(&before, &after);
    if let Some(body) = patch.as_object_mut() {
        if body.is_empty() {
            return Ok(None);
        }

        if let Some(rv) = &base.metadata.resource_version {
            let metadata = body
                .entry("metadata".to_string())
                .or_insert_with(|| json!({}));
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert("resourceVersion".to_string(), json!(rv));
            }
        }
    }

    Ok(Some(patch))
}

/// Patch an object from a mutated copy, optimistic on the base's version.
pub async fn patch_with_base(
    store: &dyn ObjectStore,
    ar: &ApiResource,
    base: &DynamicObject,
    updated: &DynamicObject,
) -> Result<()> {
    let Some(body) = optimistic_patch_body(base, updated)? else {
        return Ok(());
    };

    let namespace = base.metadata.namespace.clone().unwrap_or_default();
    let name = base.metadata.name.clone().unwrap_or_default();
    store.patch(ar, &namespace, &name, &body).await?;
    Ok(())
}
