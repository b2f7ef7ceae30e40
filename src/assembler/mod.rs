//! Resource assembly
//!
//! Turns the controller configuration and everything known about one shoot
//! into the two bundles the actuator applies:
//!
//! - the cluster bundle (`extension-fits-accounting-shoot`): RBAC for the
//!   exporter inside the shoot
//! - the control-plane bundle (`extension-fits-accounting`): TLS secret,
//!   exporter Deployment and, when configured, a registry credential
//!
//! Assembly does no I/O. Identical inputs produce identical bundles, which is
//! what makes a repeated reconcile a no-op at the store.

mod exporter;
mod rbac;

pub use exporter::{
    shoot_access_secret, ACCESS_SECRET_NAME, GENERIC_KUBECONFIG_DIR, HEALTH_PORT,
    REGISTRY_SECRET_NAME, TLS_SECRET_NAME,
};
pub use rbac::{CLUSTER_ROLE_NAME, SERVICE_ACCOUNT_NAMESPACE};

use tracing::debug;

use crate::bundle::{BundleScope, ResourceBundle};
use crate::config::ControllerConfiguration;
use crate::crd::{ClusterDescriptor, InfraFacts};
use crate::imagevector::{ImageVector, ACCOUNTING_EXPORTER_IMAGE};
use crate::inventory::InventoryRecord;
use crate::{Error, CLUSTER_BUNDLE, CONTROL_PLANE_BUNDLE};

/// Name shared by the exporter's Deployment, container and service account
pub const EXPORTER_NAME: &str = "accounting-exporter";

/// Credentials the exporter uses to reach the shoot API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessCredentials {
    /// Secret in the control-plane namespace holding the access token
    pub token_secret: String,
}

impl Default for AccessCredentials {
    fn default() -> Self {
        Self {
            token_secret: ACCESS_SECRET_NAME.to_string(),
        }
    }
}

/// Everything one assembly depends on
#[derive(Clone, Copy, Debug)]
pub struct AssemblyInput<'a> {
    /// Controller configuration
    pub config: &'a ControllerConfiguration,
    /// Shoot control-plane namespace on the seed
    pub namespace: &'a str,
    /// Infrastructure placement
    pub infra: &'a InfraFacts,
    /// Inventory record of the shoot's project
    pub project: &'a InventoryRecord,
    /// Shoot identity
    pub cluster: &'a ClusterDescriptor,
    /// Shoot access credentials
    pub access: &'a AccessCredentials,
}

/// The two bundles of one shoot
#[derive(Clone, Debug, PartialEq)]
pub struct Bundles {
    /// Objects applied inside the shoot
    pub cluster: ResourceBundle,
    /// Objects applied to the control-plane namespace
    pub control_plane: ResourceBundle,
}

/// Builds bundles from controller configuration and shoot facts
#[derive(Clone, Debug)]
pub struct ResourceAssembler {
    images: ImageVector,
}

impl ResourceAssembler {
    /// Create an assembler resolving images from `images`
    pub fn new(images: ImageVector) -> Self {
        Self { images }
    }

    /// Build both bundles
    pub fn assemble(&self, input: &AssemblyInput<'_>) -> Result<Bundles, Error> {
        let image = self.images.find_image(ACCOUNTING_EXPORTER_IMAGE)?;

        let mut cluster =
            ResourceBundle::new(CLUSTER_BUNDLE, BundleScope::Cluster, input.namespace);
        cluster.push(&rbac::cluster_role())?;
        cluster.push(&rbac::cluster_role_binding())?;

        let registry_secret = exporter::registry_secret(input)?;
        let mut control_plane =
            ResourceBundle::new(CONTROL_PLANE_BUNDLE, BundleScope::ControlPlane, input.namespace);
        control_plane.push(&exporter::tls_secret(input))?;
        control_plane.push(&exporter::deployment(input, image, registry_secret.is_some())?)?;
        if let Some(secret) = &registry_secret {
            control_plane.push(secret)?;
        }

        debug!(
            namespace = %input.namespace,
            cluster_objects = cluster.resources.len(),
            control_plane_objects = control_plane.resources.len(),
            hibernated = input.cluster.hibernated,
            "assembled bundles"
        );
        Ok(Bundles {
            cluster,
            control_plane,
        })
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
