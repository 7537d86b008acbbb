//! Run configuration and input validation
//!
//! Inputs arrive from the CLI; everything here is validated before the first
//! remote call so bad flags never leave partial state behind.

use std::path::PathBuf;

use crate::names::is_valid_upgrade_id;
use crate::version::parse_tolerant;
use crate::{Error, Result};

/// Configuration for one upgrade run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Desired Kubernetes version. When unset, the run targets the highest
    /// version already present on the control plane.
    pub kubernetes_version: Option<String>,
    /// Infrastructure spec field to override on replacement infra objects.
    pub image_field: Option<String>,
    /// Value for the image field override.
    pub image_id: Option<String>,
    /// Identifier tying replacement objects and annotations to this run.
    /// Defaults to the current Unix timestamp; reuse the id of a failed run
    /// to resume it.
    pub upgrade_id: Option<String>,
    /// Path to the management cluster kubeconfig. Defaults to the standard
    /// loading rules.
    pub management_kubeconfig: Option<PathBuf>,
    /// Kubeconfig context for the management cluster.
    pub management_context: Option<String>,
    /// Namespace of the Cluster object in the management cluster.
    pub cluster_namespace: String,
    /// Name of the Cluster object in the management cluster.
    pub cluster_name: String,
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::validation("cluster name is required"));
        }
        if self.cluster_namespace.is_empty() {
            return Err(Error::validation("cluster namespace is required"));
        }

        if self.image_field.is_some() != self.image_id.is_some() {
            return Err(Error::validation(
                "when specifying image id, image field is required (and vice versa)",
            ));
        }

        if let Some(version) = &self.kubernetes_version {
            parse_tolerant(version)?;
        }

        if let Some(upgrade_id) = &self.upgrade_id {
            if !is_valid_upgrade_id(upgrade_id) {
                return Err(Error::validation(
                    "upgrade ID must be a timestamp containing only digits",
                ));
            }
        }

        Ok(())
    }

    /// The upgrade id to run under: the configured one, or the current Unix
    /// timestamp in seconds.
    pub fn effective_upgrade_id(&self) -> String {
        match &self.upgrade_id {
            Some(id) => id.clone(),
            None => chrono::Utc::now().timestamp().to_string(),
        }
    }
}
