//! Error types for the upgrade tool

use thiserror::Error;

/// Main error type for upgrade operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid input: bad flags, unparsable versions, malformed upgrade id
    #[error("validation error: {0}")]
    Validation(String),

    /// A mandatory object was not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Etcd operation failed (health check, member list, member removal)
    #[error("etcd error: {0}")]
    Etcd(String),

    /// A bounded wait exhausted its deadline
    #[error("timed out {0}")]
    Timeout(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an etcd error with the given message
    pub fn etcd(msg: impl Into<String>) -> Self {
        Self::Etcd(msg.into())
    }

    /// Create a timeout error describing the operation that was waited on
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
