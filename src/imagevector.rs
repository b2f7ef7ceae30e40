//! Image vector
//!
//! Container images are pinned in `charts/images.yaml`, which is compiled
//! into the binary. An override file (usually pointed to by
//! `IMAGEVECTOR_OVERWRITE`) replaces entries with the same name.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Name of the exporter image in the vector
pub const ACCOUNTING_EXPORTER_IMAGE: &str = "accounting-exporter";

const EMBEDDED: &str = include_str!("../charts/images.yaml");

/// A single image entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Lookup name
    pub name: String,
    /// Source code location, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repository: Option<String>,
    /// Image repository
    pub repository: String,
    /// Tag or `sha256:` digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ImageSource {
    /// Full image reference, e.g. `repo:tag` or `repo@sha256:...`
    pub fn reference(&self) -> String {
        match self.tag.as_deref() {
            Some(tag) if tag.starts_with("sha256:") => format!("{}@{tag}", self.repository),
            Some(tag) => format!("{}:{tag}", self.repository),
            None => self.repository.clone(),
        }
    }
}

/// Ordered set of images
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageVector {
    /// Image entries
    #[serde(default)]
    pub images: Vec<ImageSource>,
}

impl ImageVector {
    /// Vector compiled into the binary
    pub fn embedded() -> Result<Self, Error> {
        Self::from_yaml(EMBEDDED)
    }

    /// Parse a vector document
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        serde_yaml::from_str(raw).map_err(|e| Error::config(format!("invalid image vector: {e}")))
    }

    /// Embedded vector with an optional override file applied
    pub fn load(overwrite: Option<&Path>) -> Result<Self, Error> {
        let vector = Self::embedded()?;
        match overwrite {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read image vector {}: {e}", path.display()))
                })?;
                Ok(vector.overwrite(Self::from_yaml(&raw)?))
            }
            None => Ok(vector),
        }
    }

    /// Replace entries by name with those from `other`, appending new names
    pub fn overwrite(mut self, other: ImageVector) -> Self {
        for image in other.images {
            match self.images.iter_mut().find(|i| i.name == image.name) {
                Some(existing) => *existing = image,
                None => self.images.push(image),
            }
        }
        self
    }

    /// Resolve an image reference by name
    pub fn find_image(&self, name: &str) -> Result<String, Error> {
        self.images
            .iter()
            .find(|i| i.name == name)
            .map(ImageSource::reference)
            .ok_or_else(|| Error::config(format!("failed to find image {name:?} in image vector")))
    }
}
