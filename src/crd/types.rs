//! Shared status types for Gardener extension resources

use chrono::{SecondsFormat, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Operation recorded in `status.lastOperation.type`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationType {
    /// First reconcile of a new resource
    Create,
    /// Regular reconcile
    Reconcile,
    /// Deletion
    Delete,
    /// Control plane migration, source side
    Migrate,
    /// Control plane migration, destination side
    Restore,
}

/// State recorded in `status.lastOperation.state`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// Operation is running
    Processing,
    /// Operation finished
    Succeeded,
    /// Operation failed and will be retried
    Error,
    /// Operation failed and will not be retried
    Failed,
}

impl LastOperationState {
    fn progress(self) -> i32 {
        match self {
            LastOperationState::Processing => 1,
            LastOperationState::Error | LastOperationState::Failed => 50,
            LastOperationState::Succeeded => 100,
        }
    }
}

/// Last operation performed on the resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation type
    #[serde(rename = "type")]
    pub type_: LastOperationType,

    /// Operation state
    pub state: LastOperationState,

    /// Human-readable description
    pub description: String,

    /// RFC3339 timestamp of the last update
    pub last_update_time: String,

    /// Progress in percent
    pub progress: i32,
}

impl LastOperation {
    /// Record `state` for `type_` at the current time
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            state,
            description: description.into(),
            last_update_time: now(),
            progress: state.progress(),
        }
    }
}

/// Last error that occurred on the resource
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Error message
    pub description: String,

    /// Gardener error codes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,

    /// RFC3339 timestamp of the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl LastError {
    /// Record an error at the current time
    pub fn new(description: impl Into<String>, codes: Vec<String>) -> Self {
        Self {
            description: description.into(),
            codes,
            last_update_time: Some(now()),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Schema for embedded raw documents (`runtime.RawExtension`)
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_operation_serializes_with_gardener_field_names() {
        let op = LastOperation::new(
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            "accounting exporter deployed",
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "Reconcile");
        assert_eq!(value["state"], "Succeeded");
        assert_eq!(value["progress"], 100);
        assert!(value["lastUpdateTime"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn failed_operations_report_partial_progress() {
        let op =
            LastOperation::new(LastOperationType::Delete, LastOperationState::Error, "timeout");
        assert_eq!(op.progress, 50);
    }

    #[test]
    fn last_error_omits_empty_codes() {
        let value = serde_json::to_value(LastError::new("boom", vec![])).unwrap();
        assert!(value.get("codes").is_none());
        assert_eq!(value["description"], "boom");
    }
}
