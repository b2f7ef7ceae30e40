//! Manifest store
//!
//! Applies and removes bundles as a unit. The kube-backed store records each
//! bundle as a Gardener `ManagedResource` plus a data `Secret` holding the
//! rendered objects; gardener-resource-manager does the actual rollout into
//! the seed namespace or the shoot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::bundle::{BundleScope, ResourceBundle};
use crate::kube_utils::{build_api_resource, is_not_found};
use crate::{Error, BUNDLE_ORIGIN, FIELD_MANAGER};

/// apiVersion of Gardener's ManagedResource
pub const MANAGED_RESOURCE_API_VERSION: &str = "resources.gardener.cloud/v1alpha1";

/// Annotation on the ManagedResource recording the applied bundle digest
pub const DIGEST_ANNOTATION: &str = "accounting.fits.extensions.gardener.cloud/bundle-digest";

/// Resource class handled by the seed's resource manager
pub const SEED_CLASS: &str = "seed";

/// Result of applying a bundle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The bundle was written
    Applied,
    /// The recorded bundle already matched; nothing was written
    Unchanged,
}

/// Applies and removes named bundles
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Create or update a bundle; unchanged bundles are a no-op
    async fn apply_bundle(&self, bundle: &ResourceBundle) -> Result<ApplyOutcome, Error>;

    /// Request removal of a bundle; absent bundles are not an error
    async fn delete_bundle(
        &self,
        scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;

    /// Whether a bundle and everything it deployed is gone
    async fn is_deleted(
        &self,
        scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error>;
}

/// Name of the secret holding a bundle's rendered objects
pub fn data_secret_name(bundle: &str) -> String {
    format!("managedresource-{bundle}")
}

/// Secret holding a bundle's rendered objects
pub fn data_secret(bundle: &ResourceBundle) -> Result<Secret, Error> {
    let data = bundle
        .to_files()?
        .into_iter()
        .map(|(file, yaml)| (file, ByteString(yaml.into_bytes())))
        .collect::<BTreeMap<_, _>>();

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(data_secret_name(&bundle.name)),
            namespace: Some(bundle.namespace.clone()),
            labels: Some(BTreeMap::from([(
                "origin".to_string(),
                BUNDLE_ORIGIN.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
}

/// ManagedResource manifest referencing the bundle's data secret
pub fn managed_resource(bundle: &ResourceBundle, digest: &str) -> serde_json::Value {
    let mut spec = json!({
        "secretRefs": [{"name": data_secret_name(&bundle.name)}],
        "keepObjects": false,
    });
    match bundle.scope {
        BundleScope::ControlPlane => {
            spec["class"] = json!(SEED_CLASS);
        }
        BundleScope::Cluster => {
            spec["injectLabels"] = json!({"shoot.gardener.cloud/no-cleanup": "true"});
        }
    }

    json!({
        "apiVersion": MANAGED_RESOURCE_API_VERSION,
        "kind": "ManagedResource",
        "metadata": {
            "name": bundle.name,
            "namespace": bundle.namespace,
            "labels": {"origin": BUNDLE_ORIGIN},
            "annotations": {DIGEST_ANNOTATION: digest},
        },
        "spec": spec,
    })
}

/// Store backed by Gardener ManagedResources
#[derive(Clone)]
pub struct ManagedResourceStore {
    client: Client,
    api_resource: ApiResource,
}

impl ManagedResourceStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_resource: build_api_resource(
                MANAGED_RESOURCE_API_VERSION,
                "ManagedResource",
                "managedresources",
            ),
        }
    }

    fn managed_resources(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn recorded_digest(
        &self,
        bundle: &ResourceBundle,
    ) -> Result<Option<String>, kube::Error> {
        let existing = self
            .managed_resources(&bundle.namespace)
            .get_opt(&bundle.name)
            .await?;
        Ok(existing.and_then(|mr| {
            mr.metadata
                .annotations
                .and_then(|mut a| a.remove(DIGEST_ANNOTATION))
        }))
    }
}

#[async_trait]
impl ManifestStore for ManagedResourceStore {
    #[instrument(
        skip(self, bundle),
        fields(bundle = %bundle.name, namespace = %bundle.namespace, scope = %bundle.scope)
    )]
    async fn apply_bundle(&self, bundle: &ResourceBundle) -> Result<ApplyOutcome, Error> {
        let digest = bundle.digest()?;
        let apply_err = |e: kube::Error| Error::apply(&bundle.name, e.to_string());

        let recorded = self.recorded_digest(bundle).await.map_err(apply_err)?;
        if recorded.as_deref() == Some(digest.as_str()) {
            debug!("bundle unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let secret = data_secret(bundle)?;
        let secret_name = data_secret_name(&bundle.name);
        self.secrets(&bundle.namespace)
            .patch(&secret_name, &params, &Patch::Apply(&secret))
            .await
            .map_err(apply_err)?;

        self.managed_resources(&bundle.namespace)
            .patch(&bundle.name, &params, &Patch::Apply(&managed_resource(bundle, &digest)))
            .await
            .map_err(apply_err)?;

        info!(objects = bundle.resources.len(), "bundle applied");
        Ok(ApplyOutcome::Applied)
    }

    #[instrument(skip(self))]
    async fn delete_bundle(
        &self,
        scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        match self
            .managed_resources(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => info!("managed resource deletion requested"),
            Err(e) if is_not_found(&e) => debug!("managed resource already gone"),
            Err(e) => return Err(e.into()),
        }

        match self
            .secrets(namespace)
            .delete(&data_secret_name(name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_deleted(
        &self,
        _scope: BundleScope,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        Ok(self.managed_resources(namespace).get_opt(name).await?.is_none())
    }
}
