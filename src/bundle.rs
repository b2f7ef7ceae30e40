//! Resource bundles
//!
//! A bundle is a named, ordered list of Kubernetes objects applied and
//! removed as a unit. Bundles are rebuilt on every reconcile and never
//! mutated afterwards; their digest lets the store skip unchanged applies.

use std::collections::BTreeMap;
use std::fmt;

use aws_lc_rs::digest;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use crate::Error;

/// Where the objects of a bundle end up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BundleScope {
    /// Inside the shoot cluster
    Cluster,
    /// In the shoot's control-plane namespace on the seed
    ControlPlane,
}

impl fmt::Display for BundleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleScope::Cluster => write!(f, "cluster"),
            BundleScope::ControlPlane => write!(f, "control-plane"),
        }
    }
}

/// One serialized object
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDescriptor {
    /// Object kind
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Full manifest including apiVersion and kind
    pub manifest: serde_json::Value,
}

impl ResourceDescriptor {
    /// Serialize a typed object
    pub fn from_object<T>(obj: &T) -> Result<Self, Error>
    where
        T: k8s_openapi::Resource + k8s_openapi::Metadata<Ty = ObjectMeta> + Serialize,
    {
        let meta = obj.metadata();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::internal(format!("{} without a name", T::KIND)))?;
        Ok(Self {
            kind: T::KIND.to_string(),
            name,
            namespace: meta.namespace.clone(),
            manifest: serde_json::to_value(obj)?,
        })
    }

    /// Key of the object inside the bundle's data secret
    pub fn file_name(&self) -> String {
        format!(
            "{}__{}__{}.yaml",
            self.kind.to_lowercase(),
            self.namespace.as_deref().unwrap_or_default(),
            self.name.replace(':', "_")
        )
    }
}

/// Named, ordered set of objects
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceBundle {
    /// Bundle name
    pub name: String,
    /// Target scope
    pub scope: BundleScope,
    /// Namespace the bundle is recorded in
    pub namespace: String,
    /// Objects in apply order
    pub resources: Vec<ResourceDescriptor>,
}

impl ResourceBundle {
    /// Create an empty bundle
    pub fn new(name: impl Into<String>, scope: BundleScope, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope,
            namespace: namespace.into(),
            resources: Vec::new(),
        }
    }

    /// Append a typed object
    pub fn push<T>(&mut self, obj: &T) -> Result<(), Error>
    where
        T: k8s_openapi::Resource + k8s_openapi::Metadata<Ty = ObjectMeta> + Serialize,
    {
        self.resources.push(ResourceDescriptor::from_object(obj)?);
        Ok(())
    }

    /// Find an object by kind and name
    pub fn find(&self, kind: &str, name: &str) -> Option<&ResourceDescriptor> {
        self.resources
            .iter()
            .find(|r| r.kind == kind && r.name == name)
    }

    /// Objects rendered as YAML, keyed by [`ResourceDescriptor::file_name`]
    pub fn to_files(&self) -> Result<BTreeMap<String, String>, Error> {
        self.resources
            .iter()
            .map(|r| -> Result<(String, String), Error> {
                Ok((r.file_name(), serde_yaml::to_string(&r.manifest)?))
            })
            .collect()
    }

    /// SHA-256 over the rendered objects in bundle order
    pub fn digest(&self) -> Result<String, Error> {
        let mut ctx = digest::Context::new(&digest::SHA256);
        for resource in &self.resources {
            ctx.update(resource.file_name().as_bytes());
            ctx.update(&[0]);
            ctx.update(serde_json::to_string(&resource.manifest)?.as_bytes());
            ctx.update(&[0]);
        }
        Ok(ctx
            .finish()
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect())
    }
}
