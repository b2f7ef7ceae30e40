//! Gardener `Cluster` resource
//!
//! Cluster-scoped, named after the shoot's control-plane namespace. Its
//! `spec.shoot` holds the complete Shoot document, from which the controller
//! reads identity, hibernation state and the metal infrastructure config.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::preserve_unknown_fields;
use crate::Error;

/// Annotation on the Cluster naming the generic token kubeconfig secret
pub const GENERIC_KUBECONFIG_ANNOTATION: &str =
    "generic-token-kubeconfig.secret.gardener.cloud/name";

/// Secret name used when the annotation is absent
pub const DEFAULT_GENERIC_KUBECONFIG_SECRET: &str = "generic-token-kubeconfig";

/// Specification of a Cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Raw CloudProfile document
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub cloud_profile: serde_json::Value,

    /// Raw Seed document
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub seed: serde_json::Value,

    /// Raw Shoot document
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub shoot: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Shoot {
    #[serde(default)]
    metadata: ShootMeta,
    #[serde(default)]
    spec: ShootSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ShootMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShootSpec {
    #[serde(default)]
    hibernation: Option<Hibernation>,
    #[serde(default)]
    provider: ShootProvider,
}

#[derive(Debug, Default, Deserialize)]
struct Hibernation {
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShootProvider {
    #[serde(default)]
    infrastructure_config: Option<serde_json::Value>,
}

/// Subset of the metal infrastructure config the exporter needs
#[derive(Debug, Default, Deserialize)]
struct InfrastructureConfig {
    #[serde(rename = "partitionID", default)]
    partition_id: String,
    #[serde(rename = "projectID", default)]
    project_id: String,
}

/// Placement of a cluster in the metal infrastructure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfraFacts {
    /// metal partition
    pub partition_id: String,
    /// metal project
    pub project_id: String,
}

/// What the controller knows about a shoot cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    /// Shoot uid
    pub uid: String,
    /// Shoot name
    pub name: String,
    /// Whether the shoot is hibernated
    pub hibernated: bool,
    /// Infrastructure placement, if the shoot declares one
    pub infrastructure: Option<InfraFacts>,
    /// Secret holding the generic token kubeconfig for the shoot
    pub generic_kubeconfig_secret: String,
}

impl ClusterDescriptor {
    /// Extract the descriptor from a Cluster resource
    pub fn from_cluster(cluster: &Cluster) -> Result<Self, Error> {
        if cluster.spec.shoot.is_null() {
            return Err(Error::validation(format!(
                "cluster {} carries no shoot",
                cluster.name_any()
            )));
        }
        let shoot: Shoot = serde_json::from_value(cluster.spec.shoot.clone()).map_err(|e| {
            Error::validation(format!("cluster {} has a malformed shoot: {e}", cluster.name_any()))
        })?;

        if shoot.metadata.uid.is_empty() {
            return Err(Error::validation(format!(
                "shoot in cluster {} has no uid",
                cluster.name_any()
            )));
        }

        let infrastructure = match shoot.spec.provider.infrastructure_config {
            Some(raw) if !raw.is_null() => {
                let infra: InfrastructureConfig = serde_json::from_value(raw).map_err(|e| {
                    Error::validation(format!("malformed infrastructure config: {e}"))
                })?;
                (!infra.project_id.is_empty()).then_some(InfraFacts {
                    partition_id: infra.partition_id,
                    project_id: infra.project_id,
                })
            }
            _ => None,
        };

        let generic_kubeconfig_secret = cluster
            .annotations()
            .get(GENERIC_KUBECONFIG_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| DEFAULT_GENERIC_KUBECONFIG_SECRET.to_string());

        Ok(Self {
            uid: shoot.metadata.uid,
            name: shoot.metadata.name,
            hibernated: shoot
                .spec
                .hibernation
                .and_then(|h| h.enabled)
                .unwrap_or(false),
            infrastructure,
            generic_kubeconfig_secret,
        })
    }

    /// Infrastructure placement, or a validation error if it is missing
    pub fn infra_facts(&self) -> Result<&InfraFacts, Error> {
        self.infrastructure.as_ref().ok_or_else(|| {
            Error::validation(format!(
                "shoot {} declares no metal project in its infrastructure config",
                self.name
            ))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_cluster(hibernated: bool) -> Cluster {
        Cluster::new(
            "shoot--p1--c1",
            ClusterSpec {
                cloud_profile: serde_json::Value::Null,
                seed: serde_json::Value::Null,
                shoot: json!({
                    "apiVersion": "core.gardener.cloud/v1beta1",
                    "kind": "Shoot",
                    "metadata": {"name": "c1", "namespace": "garden-p1", "uid": "c1-uid"},
                    "spec": {
                        "hibernation": {"enabled": hibernated},
                        "provider": {
                            "type": "metal",
                            "infrastructureConfig": {
                                "apiVersion": "metal.provider.extensions.gardener.cloud/v1alpha1",
                                "kind": "InfrastructureConfig",
                                "firewall": {"size": "c1-xlarge-x86"},
                                "partitionID": "fra-equ01",
                                "projectID": "p1"
                            }
                        }
                    }
                }),
            },
        )
    }

    #[test]
    fn extracts_identity_and_placement() {
        let descriptor = ClusterDescriptor::from_cluster(&sample_cluster(false)).unwrap();
        assert_eq!(descriptor.uid, "c1-uid");
        assert_eq!(descriptor.name, "c1");
        assert!(!descriptor.hibernated);
        assert_eq!(
            descriptor.infra_facts().unwrap(),
            &InfraFacts {
                partition_id: "fra-equ01".to_string(),
                project_id: "p1".to_string(),
            }
        );
        assert_eq!(descriptor.generic_kubeconfig_secret, DEFAULT_GENERIC_KUBECONFIG_SECRET);
    }

    #[test]
    fn reads_hibernation_flag() {
        let descriptor = ClusterDescriptor::from_cluster(&sample_cluster(true)).unwrap();
        assert!(descriptor.hibernated);
    }

    #[test]
    fn generic_kubeconfig_secret_follows_annotation() {
        let mut cluster = sample_cluster(false);
        cluster.metadata.annotations = Some(
            [(
                GENERIC_KUBECONFIG_ANNOTATION.to_string(),
                "generic-token-kubeconfig-abc123".to_string(),
            )]
            .into(),
        );
        let descriptor = ClusterDescriptor::from_cluster(&cluster).unwrap();
        assert_eq!(descriptor.generic_kubeconfig_secret, "generic-token-kubeconfig-abc123");
    }

    #[test]
    fn missing_infrastructure_config_fails_only_when_needed() {
        let mut cluster = sample_cluster(false);
        cluster.spec.shoot["spec"]["provider"]
            .as_object_mut()
            .unwrap()
            .remove("infrastructureConfig");

        let descriptor = ClusterDescriptor::from_cluster(&cluster).unwrap();
        assert!(descriptor.infrastructure.is_none());
        assert!(matches!(descriptor.infra_facts(), Err(Error::Validation(_))));
    }

    #[test]
    fn empty_project_id_counts_as_missing() {
        let mut cluster = sample_cluster(false);
        cluster.spec.shoot["spec"]["provider"]["infrastructureConfig"]["projectID"] = json!("");
        let descriptor = ClusterDescriptor::from_cluster(&cluster).unwrap();
        assert!(descriptor.infra_facts().is_err());
    }

    #[test]
    fn cluster_without_shoot_is_rejected() {
        let mut cluster = sample_cluster(false);
        cluster.spec.shoot = serde_json::Value::Null;
        assert!(matches!(
            ClusterDescriptor::from_cluster(&cluster),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn shoot_without_uid_is_rejected() {
        let mut cluster = sample_cluster(false);
        cluster.spec.shoot["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("uid");
        assert!(ClusterDescriptor::from_cluster(&cluster).is_err());
    }
}
