//! Extension controller and actuator
//!
//! [`reconcile`] and [`error_policy`] plug into `kube::runtime::Controller`;
//! the [`Actuator`] holds the lifecycle logic and is usable on its own.

mod actuator;
mod client;
mod extension;

pub use actuator::{
    Actuator, ExtensionRequest, Operation, ProjectCache, DEFAULT_DELETE_POLL_INTERVAL,
    DEFAULT_DELETE_TIMEOUT,
};
pub use client::{has_finalizer, KubeClient, KubeClientImpl};
pub use extension::{
    error_policy, reconcile, requeue_for, select_operation, status_for, Context, ContextBuilder,
    DEFAULT_RESYNC_INTERVAL, FORCE_DELETION_ANNOTATION, NOT_FOUND_REQUEUE, RETRY_REQUEUE,
};
