//! Extension actuator
//!
//! Drives the lifecycle of the accounting exporter for one shoot:
//!
//! | Operation   | Effect                                                     |
//! |-------------|------------------------------------------------------------|
//! | Reconcile   | resolve identity, assemble, apply control plane then shoot |
//! | Delete      | delete both bundles, wait until both are gone              |
//! | Restore     | same as Reconcile                                          |
//! | Migrate     | nothing; the bundles stay with the shoot                   |
//! | ForceDelete | nothing; the orchestrator removes owned objects            |
//!
//! Identity resolution (cluster, infrastructure, inventory) finishes before
//! anything is written, so a failed lookup never leaves half-applied state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::KubeClient;
use crate::assembler::{
    shoot_access_secret, AccessCredentials, AssemblyInput, Bundles, ResourceAssembler,
};
use crate::bundle::BundleScope;
use crate::cache::{CacheError, FetchAllCache};
use crate::config::ControllerConfiguration;
use crate::crd::{AccountingConfig, ClusterDescriptor};
use crate::inventory::InventoryRecord;
use crate::manifest_store::{ApplyOutcome, ManifestStore};
use crate::{Error, CLUSTER_BUNDLE, CONTROL_PLANE_BUNDLE};

/// How long Delete waits for both bundles to disappear
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// How often Delete checks whether the bundles are gone
pub const DEFAULT_DELETE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Project inventory cache keyed by project id
pub type ProjectCache = FetchAllCache<String, InventoryRecord>;

/// Lifecycle operation requested by the orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Bring the shoot's bundles to the desired state
    Reconcile,
    /// Remove the shoot's bundles
    Delete,
    /// Re-create state after a control plane migration
    Restore,
    /// Prepare for a control plane migration
    Migrate,
    /// Deletion where the orchestrator removes everything itself
    ForceDelete,
}

impl Operation {
    /// Operation name as used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Reconcile => "reconcile",
            Operation::Delete => "delete",
            Operation::Restore => "restore",
            Operation::Migrate => "migrate",
            Operation::ForceDelete => "force-delete",
        }
    }
}

/// What the orchestrator asks of the actuator for one Extension
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionRequest {
    /// Shoot control-plane namespace
    pub namespace: String,
    /// Raw provider config from the Extension
    pub provider_config: Option<serde_json::Value>,
}

impl From<CacheError<InventoryRecord>> for Error {
    fn from(err: CacheError<InventoryRecord>) -> Self {
        match err {
            CacheError::NotFound { key } => Error::NotFound { project_id: key },
            CacheError::Fetch { message, stale } => {
                if let Some(record) = stale {
                    warn!(
                        project = %record.project_id,
                        "inventory refresh failed, previously known project is not used"
                    );
                }
                Error::Fetch(message)
            }
        }
    }
}

/// Orchestrates bundle assembly, application and removal
pub struct Actuator {
    config: Arc<ControllerConfiguration>,
    kube: Arc<dyn KubeClient>,
    store: Arc<dyn ManifestStore>,
    projects: ProjectCache,
    assembler: ResourceAssembler,
    delete_timeout: Duration,
    poll_interval: Duration,
}

impl Actuator {
    /// Create an actuator with the default delete timeout
    pub fn new(
        config: Arc<ControllerConfiguration>,
        kube: Arc<dyn KubeClient>,
        store: Arc<dyn ManifestStore>,
        projects: ProjectCache,
        assembler: ResourceAssembler,
    ) -> Self {
        Self {
            config,
            kube,
            store,
            projects,
            assembler,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            poll_interval: DEFAULT_DELETE_POLL_INTERVAL,
        }
    }

    /// Override how long Delete waits for the bundles to disappear
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Override how often Delete checks the store
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Configured delete timeout
    pub fn delete_timeout(&self) -> Duration {
        self.delete_timeout
    }

    /// Run the requested operation
    pub async fn dispatch(
        &self,
        operation: Operation,
        request: &ExtensionRequest,
    ) -> Result<(), Error> {
        match operation {
            Operation::Reconcile => self.reconcile(request).await,
            Operation::Delete => self.delete(request).await,
            Operation::Restore => self.restore(request).await,
            Operation::Migrate => self.migrate(request).await,
            Operation::ForceDelete => self.force_delete(request).await,
        }
    }

    /// Resolve everything the shoot's bundles depend on and assemble them
    ///
    /// Performs lookups but no writes.
    pub async fn desired_bundles(&self, request: &ExtensionRequest) -> Result<Bundles, Error> {
        AccountingConfig::decode(request.provider_config.as_ref())?;

        let cluster = self
            .kube
            .get_cluster(&request.namespace)
            .await?
            .ok_or_else(|| Error::ClusterNotFound {
                name: request.namespace.clone(),
            })?;
        let descriptor = ClusterDescriptor::from_cluster(&cluster)?;
        let infra = descriptor.infra_facts()?;
        let project = self.projects.get(&infra.project_id).await?;

        self.assembler.assemble(&AssemblyInput {
            config: &self.config,
            namespace: &request.namespace,
            infra,
            project: &project,
            cluster: &descriptor,
            access: &AccessCredentials::default(),
        })
    }

    /// Apply the shoot's bundles; repeated calls with unchanged inputs write nothing
    #[instrument(skip(self, request), fields(namespace = %request.namespace))]
    pub async fn reconcile(&self, request: &ExtensionRequest) -> Result<(), Error> {
        let bundles = self.desired_bundles(request).await?;

        self.kube
            .ensure_access_secret(&shoot_access_secret(&request.namespace))
            .await?;

        for bundle in [&bundles.control_plane, &bundles.cluster] {
            match self.store.apply_bundle(bundle).await? {
                ApplyOutcome::Applied => info!(bundle = %bundle.name, "bundle applied"),
                ApplyOutcome::Unchanged => debug!(bundle = %bundle.name, "bundle unchanged"),
            }
        }
        Ok(())
    }

    /// Remove both bundles and wait until the store confirms they are gone
    ///
    /// Fails with [`Error::DeleteTimeout`] once the deadline passes; deletion
    /// requests already issued stay in place.
    #[instrument(skip(self, request), fields(namespace = %request.namespace))]
    pub async fn delete(&self, request: &ExtensionRequest) -> Result<(), Error> {
        let namespace = request.namespace.as_str();
        let bundles = [
            (BundleScope::Cluster, CLUSTER_BUNDLE),
            (BundleScope::ControlPlane, CONTROL_PLANE_BUNDLE),
        ];

        for (scope, name) in bundles {
            self.store.delete_bundle(scope, namespace, name).await?;
        }
        info!("bundle deletion requested, waiting for removal");

        let deadline = Instant::now() + self.delete_timeout;
        let mut remaining = bundles.to_vec();
        loop {
            let mut still_present = Vec::with_capacity(remaining.len());
            for (scope, name) in remaining {
                let check = self.store.is_deleted(scope, namespace, name);
                match tokio::time::timeout_at(deadline, check).await {
                    Ok(Ok(true)) => debug!(bundle = name, "bundle removed"),
                    Ok(Ok(false)) => still_present.push((scope, name)),
                    Ok(Err(e)) => return Err(e),
                    Err(_) => still_present.push((scope, name)),
                }
            }
            remaining = still_present;

            if remaining.is_empty() {
                info!("bundles removed");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeleteTimeout {
                    bundles: remaining.iter().map(|(_, name)| name.to_string()).collect(),
                    timeout: self.delete_timeout,
                });
            }
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }

    /// Re-create the bundles after a migration
    pub async fn restore(&self, request: &ExtensionRequest) -> Result<(), Error> {
        self.reconcile(request).await
    }

    /// Nothing to hand over; the bundles follow the shoot
    pub async fn migrate(&self, request: &ExtensionRequest) -> Result<(), Error> {
        debug!(namespace = %request.namespace, "migrate is a no-op");
        Ok(())
    }

    /// Nothing to do; the orchestrator force-deletes owned objects
    pub async fn force_delete(&self, request: &ExtensionRequest) -> Result<(), Error> {
        debug!(namespace = %request.namespace, "force delete is a no-op");
        Ok(())
    }
}
