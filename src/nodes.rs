//! Provider-id to node index for the target cluster
//!
//! Machines and Nodes are correlated through the provider id the
//! infrastructure controller stamps on both. Provider ids come in the shape
//! `<provider>://<optional path>/<id>`; the index keys on the bare `<id>` so
//! the two sides match even when one carries the full path and the other a
//! shorthand. Unparsable ids fall back to the raw string.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, warn};

use crate::target::TargetCluster;
use crate::Result;

/// Extract the bare id from a provider id string.
///
/// Returns the last path segment of `<provider>://<path>/<id>`. Input that
/// does not follow the grammar is returned verbatim.
pub fn normalize_provider_id(raw: &str) -> String {
    let Some((provider, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    if provider.is_empty() || rest.is_empty() {
        return raw.to_string();
    }
    match rest.rsplit('/').next() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => raw.to_string(),
    }
}

/// The node's hostname, taken from its status address of type `Hostname`.
pub fn hostname_for_node(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|address| address.type_ == "Hostname")
                .map(|address| address.address.clone())
        })
}

/// Refreshable mapping from normalized provider id to target-cluster node.
#[derive(Default)]
pub struct NodeIndex {
    by_provider_id: HashMap<String, Node>,
}

impl NodeIndex {
    /// Create an empty index; call [`NodeIndex::refresh`] before lookups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index from the current set of target-cluster nodes.
    pub async fn refresh(&mut self, target: &dyn TargetCluster) -> Result<()> {
        let nodes = target.list_nodes().await?;

        let mut index = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let raw = node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.clone())
                .unwrap_or_default();
            let key = normalize_provider_id(&raw);
            if key == raw && raw.contains("://") {
                warn!(
                    node = node.metadata.name.as_deref().unwrap_or_default(),
                    provider_id = %raw,
                    "Could not parse node provider id, indexing it verbatim"
                );
            }
            index.insert(key, node);
        }

        debug!(nodes = index.len(), "Refreshed provider-id index");
        self.by_provider_id = index;
        Ok(())
    }

    /// Look up the node carrying the given normalized provider id.
    pub fn lookup(&self, provider_id: &str) -> Option<&Node> {
        self.by_provider_id.get(provider_id)
    }
}
