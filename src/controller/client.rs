//! Kubernetes access for the controller

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::debug;

use crate::crd::{Cluster, Extension, ExtensionStatus, OPERATION_ANNOTATION};
use crate::{Error, FIELD_MANAGER, FINALIZER};

/// Trait abstracting Kubernetes client operations for Extensions
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get the Cluster resource of a shoot
    ///
    /// Cluster resources are named after the shoot's control-plane namespace.
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error>;

    /// Create or update the shoot access secret
    ///
    /// Only labels and annotations are applied; the token written by the
    /// token requestor is left untouched.
    async fn ensure_access_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Patch the status of an Extension
    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error>;

    /// Add the controller's finalizer to an Extension
    async fn add_finalizer(&self, extension: &Extension) -> Result<(), Error>;

    /// Remove the controller's finalizer from an Extension
    async fn remove_finalizer(&self, extension: &Extension) -> Result<(), Error>;

    /// Remove the `gardener.cloud/operation` annotation from an Extension
    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn extensions(&self, namespace: &str) -> Api<Extension> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(extension: &Extension) -> Result<String, Error> {
    extension
        .namespace()
        .ok_or_else(|| Error::validation("Extension must be namespaced"))
}

/// Whether the Extension carries the controller's finalizer
pub fn has_finalizer(extension: &Extension) -> bool {
    extension.finalizers().iter().any(|f| f == FINALIZER)
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn ensure_access_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal("access secret without namespace"))?;
        let name = secret.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(secret))
            .await?;
        debug!(secret = %name, "access secret ensured");
        Ok(())
    }

    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error> {
        let patch = json!({ "status": status });
        self.extensions(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, extension: &Extension) -> Result<(), Error> {
        let mut finalizers = extension.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.extensions(&namespace_of(extension)?)
            .patch(
                &extension.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, extension: &Extension) -> Result<(), Error> {
        let finalizers: Vec<&String> = extension
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.extensions(&namespace_of(extension)?)
            .patch(
                &extension.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: null } } });
        self.extensions(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
