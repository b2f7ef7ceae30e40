//! Extension controller
//!
//! Maps watched `Extension` objects onto actuator operations and records the
//! outcome in `status.lastOperation` / `status.lastError`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::actuator::{Actuator, ExtensionRequest, Operation, ProjectCache};
use super::client::{has_finalizer, KubeClient, KubeClientImpl};
use crate::assembler::ResourceAssembler;
use crate::cache::{FetchAll, FetchAllCache, DEFAULT_TTL};
use crate::config::ControllerConfiguration;
use crate::crd::{
    Extension, ExtensionStatus, LastError, LastOperation, LastOperationState, LastOperationType,
    OPERATION_MIGRATE, OPERATION_RESTORE,
};
use crate::imagevector::ImageVector;
use crate::inventory::{InventoryRecord, MetalProjectSource};
use crate::manifest_store::{ManagedResourceStore, ManifestStore};
use crate::metrics::OperationTimer;
use crate::{Error, EXTENSION_TYPE};

/// Annotation confirming that a deleting Extension may skip cleanup
pub const FORCE_DELETION_ANNOTATION: &str = "confirmation.gardener.cloud/force-deletion";

/// Interval between reconciles of a healthy Extension
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Requeue delay after a retryable failure
pub const RETRY_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue delay when the project is not (yet) in the inventory
pub const NOT_FOUND_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// Controller context shared by all reconciles
pub struct Context {
    /// Kubernetes client for Extension and Cluster access
    pub kube: Arc<dyn KubeClient>,
    /// Lifecycle actuator
    pub actuator: Actuator,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
}

impl Context {
    /// Create a builder wiring the real collaborators
    pub fn builder(client: Client, config: Arc<ControllerConfiguration>) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context from already constructed collaborators
    pub fn new(kube: Arc<dyn KubeClient>, actuator: Actuator) -> Self {
        Self {
            kube,
            actuator,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Override the resync interval
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }
}

/// Builder for [`Context`]
///
/// ```ignore
/// let ctx = Context::builder(client, config)
///     .image_vector_overwrite(Some(path))
///     .cache_ttl(Duration::from_secs(600))
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    config: Arc<ControllerConfiguration>,
    images: Option<ImageVector>,
    image_overwrite: Option<PathBuf>,
    cache_ttl: Duration,
    delete_timeout: Option<Duration>,
    resync_interval: Option<Duration>,
    kube: Option<Arc<dyn KubeClient>>,
    store: Option<Arc<dyn ManifestStore>>,
    source: Option<Arc<dyn FetchAll<String, InventoryRecord>>>,
}

impl ContextBuilder {
    fn new(client: Client, config: Arc<ControllerConfiguration>) -> Self {
        Self {
            client,
            config,
            images: None,
            image_overwrite: None,
            cache_ttl: DEFAULT_TTL,
            delete_timeout: None,
            resync_interval: None,
            kube: None,
            store: None,
            source: None,
        }
    }

    /// Use this image vector instead of the embedded one
    pub fn images(mut self, images: ImageVector) -> Self {
        self.images = Some(images);
        self
    }

    /// Overlay the embedded image vector with the file at `path`
    pub fn image_vector_overwrite(mut self, path: Option<PathBuf>) -> Self {
        self.image_overwrite = path;
        self
    }

    /// Set the project cache TTL
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the Delete timeout
    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = Some(timeout);
        self
    }

    /// Set the resync interval
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the manifest store (primarily for testing)
    pub fn manifest_store(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the inventory source (primarily for testing)
    pub fn project_source(mut self, source: Arc<dyn FetchAll<String, InventoryRecord>>) -> Self {
        self.source = Some(source);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let images = match self.images {
            Some(images) => images,
            None => ImageVector::load(self.image_overwrite.as_deref())?,
        };
        let source: Arc<dyn FetchAll<String, InventoryRecord>> = match self.source {
            Some(source) => source,
            None => Arc::new(MetalProjectSource::new(&self.config.accounting)?),
        };
        let projects: ProjectCache = FetchAllCache::new(self.cache_ttl, source);

        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(ManagedResourceStore::new(self.client.clone())));

        let mut actuator = Actuator::new(
            self.config,
            kube.clone(),
            store,
            projects,
            ResourceAssembler::new(images),
        );
        if let Some(timeout) = self.delete_timeout {
            actuator = actuator.with_delete_timeout(timeout);
        }

        let mut ctx = Context::new(kube, actuator);
        if let Some(interval) = self.resync_interval {
            ctx = ctx.with_resync_interval(interval);
        }
        Ok(ctx)
    }
}

/// Decide which operation an Extension asks for
pub fn select_operation(extension: &Extension) -> Operation {
    if extension.is_deleting() {
        let forced = extension
            .annotations()
            .get(FORCE_DELETION_ANNOTATION)
            .is_some_and(|v| v == "true");
        return if forced {
            Operation::ForceDelete
        } else {
            Operation::Delete
        };
    }
    match extension.operation_annotation() {
        Some(OPERATION_RESTORE) => Operation::Restore,
        Some(OPERATION_MIGRATE) => Operation::Migrate,
        _ => Operation::Reconcile,
    }
}

fn last_operation_type(extension: &Extension, operation: Operation) -> LastOperationType {
    match operation {
        Operation::Reconcile => {
            let seen = extension
                .status
                .as_ref()
                .is_some_and(|s| s.last_operation.is_some());
            if seen {
                LastOperationType::Reconcile
            } else {
                LastOperationType::Create
            }
        }
        Operation::Delete | Operation::ForceDelete => LastOperationType::Delete,
        Operation::Restore => LastOperationType::Restore,
        Operation::Migrate => LastOperationType::Migrate,
    }
}

/// Status describing the outcome of one operation
pub fn status_for(
    extension: &Extension,
    operation: Operation,
    result: &Result<(), Error>,
) -> ExtensionStatus {
    let type_ = last_operation_type(extension, operation);
    let (last_operation, last_error) = match result {
        Ok(()) => (
            LastOperation::new(
                type_,
                LastOperationState::Succeeded,
                format!("accounting extension {} succeeded", operation.as_str()),
            ),
            None,
        ),
        Err(e) => {
            let state = if e.is_retryable() || matches!(e, Error::NotFound { .. }) {
                LastOperationState::Error
            } else {
                LastOperationState::Failed
            };
            let description = format!("accounting extension {} failed: {e}", operation.as_str());
            let codes = e.error_code().map(|c| vec![c.to_string()]).unwrap_or_default();
            (
                LastOperation::new(type_, state, description.clone()),
                Some(LastError::new(description, codes)),
            )
        }
    };
    ExtensionStatus {
        last_operation: Some(last_operation),
        last_error,
        observed_generation: extension.metadata.generation,
    }
}

/// Reconcile an Extension
///
/// Adds the finalizer on first sight, runs the selected operation, patches
/// the status and, for terminal operations, releases the finalizer. A
/// successful operation clears the `gardener.cloud/operation` annotation.
/// Failures are returned after the status has been recorded so that
/// [`error_policy`] decides the requeue; the operation's error wins over a
/// failed status patch.
#[instrument(
    skip(extension, ctx),
    fields(extension = %extension.name_any(), namespace = ?extension.namespace())
)]
pub async fn reconcile(extension: Arc<Extension>, ctx: Arc<Context>) -> Result<Action, Error> {
    if extension.spec.type_ != EXTENSION_TYPE {
        debug!(r#type = %extension.spec.type_, "ignoring extension of foreign type");
        return Ok(Action::await_change());
    }

    let name = extension.name_any();
    let namespace = extension
        .namespace()
        .ok_or_else(|| Error::validation("Extension must be namespaced"))?;
    let operation = select_operation(&extension);

    let terminal = matches!(
        operation,
        Operation::Delete | Operation::ForceDelete | Operation::Migrate
    );
    if extension.is_deleting() && !has_finalizer(&extension) {
        debug!("deleting extension carries no finalizer, nothing to do");
        return Ok(Action::await_change());
    }
    if !extension.is_deleting() && !has_finalizer(&extension) && !terminal {
        ctx.kube.add_finalizer(&extension).await?;
    }

    info!(operation = operation.as_str(), "running operation");
    let request = ExtensionRequest {
        namespace: namespace.clone(),
        provider_config: extension.spec.provider_config.clone(),
    };
    let timer = OperationTimer::start(operation);
    let result = ctx.actuator.dispatch(operation, &request).await;
    timer.finish(&result);

    let status = status_for(&extension, operation, &result);
    if let Err(patch_error) = ctx
        .kube
        .patch_extension_status(&namespace, &name, &status)
        .await
    {
        match &result {
            Ok(()) => return Err(patch_error),
            Err(_) => warn!(error = %patch_error, "failed to record failed operation in status"),
        }
    }
    result?;

    if !extension.is_deleting() && extension.operation_annotation().is_some() {
        ctx.kube
            .remove_operation_annotation(&namespace, &name)
            .await?;
    }
    if terminal {
        if has_finalizer(&extension) {
            ctx.kube.remove_finalizer(&extension).await?;
        }
        info!(operation = operation.as_str(), "operation finished, finalizer released");
        return Ok(Action::await_change());
    }

    info!(operation = operation.as_str(), "operation succeeded");
    Ok(Action::requeue(ctx.resync_interval))
}

/// Requeue decision for a failed reconcile
pub fn requeue_for(error: &Error) -> Action {
    match error {
        Error::NotFound { .. } => Action::requeue(NOT_FOUND_REQUEUE),
        e if e.is_retryable() => Action::requeue(RETRY_REQUEUE),
        _ => Action::await_change(),
    }
}

/// Error policy for the Extension controller
///
/// Retryable failures requeue quickly, an unknown project is retried
/// slowly, and everything else waits for the Extension to change.
pub fn error_policy(extension: Arc<Extension>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(?error, extension = %extension.name_any(), "reconciliation failed, retrying");
    } else {
        error!(?error, extension = %extension.name_any(), "reconciliation failed");
    }
    requeue_for(error)
}
