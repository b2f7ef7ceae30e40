//! Gardener resource definitions
//!
//! The extension does not own these CRDs; the types model the parts of the
//! orchestrator's `Extension` and `Cluster` resources the controller reads and
//! writes.

mod cluster;
mod extension;
mod types;

pub use cluster::{
    Cluster, ClusterDescriptor, ClusterSpec, InfraFacts, DEFAULT_GENERIC_KUBECONFIG_SECRET,
    GENERIC_KUBECONFIG_ANNOTATION,
};
pub use extension::{
    AccountingConfig, Extension, ExtensionSpec, ExtensionStatus, ACCOUNTING_CONFIG_API_VERSION,
    ACCOUNTING_CONFIG_KIND, OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RESTORE,
};
#[cfg(test)]
pub(crate) use cluster::tests::sample_cluster;
pub use types::{LastError, LastOperation, LastOperationState, LastOperationType};
