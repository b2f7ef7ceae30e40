//! Gardener `Extension` resource
//!
//! Created by the orchestrator in each shoot's control-plane namespace. The
//! controller acts on those with `spec.type == "fits-accounting"`.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, LastError, LastOperation};
use crate::Error;

/// Annotation the orchestrator uses to request a migration step
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";
/// Value of [`OPERATION_ANNOTATION`] requesting a restore
pub const OPERATION_RESTORE: &str = "restore";
/// Value of [`OPERATION_ANNOTATION`] requesting a migration
pub const OPERATION_MIGRATE: &str = "migrate";

/// apiVersion of the provider config
pub const ACCOUNTING_CONFIG_API_VERSION: &str =
    "accounting.fits.extensions.gardener.cloud/v1alpha1";
/// kind of the provider config
pub const ACCOUNTING_CONFIG_KIND: &str = "AccountingConfig";

/// Specification of an Extension
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Extension",
    plural = "extensions",
    shortname = "ext",
    status = "ExtensionStatus",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Extension type, selects the responsible controller
    #[serde(rename = "type")]
    pub type_: String,

    /// Raw provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,
}

/// Status of an Extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Last operation performed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Last error, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Generation the status refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Extension {
    /// Value of the `gardener.cloud/operation` annotation, if set
    pub fn operation_annotation(&self) -> Option<&str> {
        self.annotations().get(OPERATION_ANNOTATION).map(String::as_str)
    }

    /// Whether the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Provider config of the accounting extension
///
/// Carries no settings yet; decoding is strict so that misspelled or
/// unsupported fields are reported instead of ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccountingConfig {
    /// Header apiVersion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Header kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl AccountingConfig {
    /// Decode the raw provider config; an absent config yields the default
    pub fn decode(raw: Option<&serde_json::Value>) -> Result<Self, Error> {
        let Some(raw) = raw.filter(|v| !v.is_null()) else {
            return Ok(Self::default());
        };

        let config: Self =
            serde_json::from_value(raw.clone()).map_err(|e| Error::decode(e.to_string()))?;

        if config.api_version.as_deref() != Some(ACCOUNTING_CONFIG_API_VERSION) {
            return Err(Error::decode(format!(
                "unsupported apiVersion {:?}, expected {ACCOUNTING_CONFIG_API_VERSION}",
                config.api_version.as_deref().unwrap_or_default()
            )));
        }
        if config.kind.as_deref() != Some(ACCOUNTING_CONFIG_KIND) {
            return Err(Error::decode(format!(
                "unsupported kind {:?}, expected {ACCOUNTING_CONFIG_KIND}",
                config.kind.as_deref().unwrap_or_default()
            )));
        }
        Ok(config)
    }
}
