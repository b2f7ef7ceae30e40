//! Error types for the accounting extension

use std::time::Duration;

use thiserror::Error;

/// Gardener error code for problems the user has to fix in configuration
pub const ERR_CONFIGURATION_PROBLEM: &str = "ERR_CONFIGURATION_PROBLEM";
/// Gardener error code for a dependency that is expected to recover on its own
pub const ERR_RETRYABLE_INFRA_DEPENDENCIES: &str = "ERR_RETRYABLE_INFRA_DEPENDENCIES";
/// Gardener error code for a dependency that needs attention
pub const ERR_INFRA_DEPENDENCIES: &str = "ERR_INFRA_DEPENDENCIES";
/// Gardener error code for resources that could not be cleaned up in time
pub const ERR_CLEANUP_CLUSTER_RESOURCES: &str = "ERR_CLEANUP_CLUSTER_RESOURCES";

/// Main error type for accounting extension operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Controller configuration or image vector is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Provider config attached to the Extension could not be decoded
    #[error("failed to decode provider config: {0}")]
    Decode(String),

    /// The inventory service could not be listed
    #[error("error fetching projects from inventory: {0}")]
    Fetch(String),

    /// Project is absent from a freshly fetched inventory snapshot
    #[error("project {project_id} not found in inventory")]
    NotFound {
        /// Project that was looked up
        project_id: String,
    },

    /// The Gardener `Cluster` for the shoot namespace does not exist (yet)
    #[error("cluster {name} not found")]
    ClusterNotFound {
        /// Cluster name, equal to the shoot's control-plane namespace
        name: String,
    },

    /// The manifest store rejected a bundle
    #[error("failed to apply bundle {bundle}: {message}")]
    Apply {
        /// Bundle name
        bundle: String,
        /// Underlying failure
        message: String,
    },

    /// Bundles were still present when the deletion deadline expired
    #[error("bundles {bundles:?} still present after waiting {timeout:?} for deletion")]
    DeleteTimeout {
        /// Bundles that had not disappeared
        bundles: Vec<String>,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster or infrastructure data required for a reconcile is missing
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a decode error with the given message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a fetch error with the given message
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create an apply error for the named bundle
    pub fn apply(bundle: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            bundle: bundle.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether running the same operation again can succeed without
    /// anything else changing first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(_)
            | Error::ClusterNotFound { .. }
            | Error::Apply { .. }
            | Error::DeleteTimeout { .. }
            | Error::Kube(_)
            | Error::Internal(_) => true,
            Error::Config(_)
            | Error::Decode(_)
            | Error::NotFound { .. }
            | Error::Validation(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Gardener error code reported in `lastError.codes`, if one applies
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) | Error::Decode(_) | Error::Validation(_) => {
                Some(ERR_CONFIGURATION_PROBLEM)
            }
            Error::Fetch(_) | Error::ClusterNotFound { .. } => {
                Some(ERR_RETRYABLE_INFRA_DEPENDENCIES)
            }
            Error::NotFound { .. } => Some(ERR_INFRA_DEPENDENCIES),
            Error::DeleteTimeout { .. } => Some(ERR_CLEANUP_CLUSTER_RESOURCES),
            Error::Apply { .. }
            | Error::Kube(_)
            | Error::Serialization(_)
            | Error::Internal(_) => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
