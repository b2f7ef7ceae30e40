//! Gardener extension deploying the FI-TS accounting exporter
//!
//! For every shoot running on metal-stack the controller deploys an
//! accounting exporter into the shoot's control-plane namespace on the seed,
//! plus the RBAC it needs inside the shoot. The exporter is labelled with the
//! shoot's tenant and project, resolved through a TTL-bounded cache over the
//! metal-api project inventory.
//!
//! # Modules
//!
//! - [`controller`] - Extension reconciler and lifecycle actuator
//! - [`assembler`] - Builds the control-plane and shoot bundles
//! - [`bundle`] - Ordered sets of manifests applied as a unit
//! - [`manifest_store`] - Applies bundles through Gardener ManagedResources
//! - [`cache`] - Single-flight fetch-all cache with TTL and stale fallback
//! - [`inventory`] - metal-api project listing with HMAC signing
//! - [`crd`] - Gardener `Extension` and `Cluster` resources
//! - [`config`] - Controller configuration file
//! - [`imagevector`] - Container image references
//! - [`egress`] - Seed firewall rule for the accounting API
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod assembler;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod egress;
pub mod error;
pub mod imagevector;
pub mod inventory;
pub mod kube_utils;
pub mod manifest_store;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// `spec.type` of the Extensions this controller handles
pub const EXTENSION_TYPE: &str = "fits-accounting";

/// Finalizer guarding bundle cleanup
pub const FINALIZER: &str = "extensions.gardener.cloud/fits-accounting";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "fits-accounting";

/// Name of the bundle applied to the control-plane namespace
pub const CONTROL_PLANE_BUNDLE: &str = "extension-fits-accounting";

/// Name of the bundle applied inside the shoot
pub const CLUSTER_BUNDLE: &str = "extension-fits-accounting-shoot";

/// `origin` label on everything the store writes
pub const BUNDLE_ORIGIN: &str = "fits-accounting";
