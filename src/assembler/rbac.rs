//! Objects applied inside the shoot cluster

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{strings, EXPORTER_NAME};

/// Name of the exporter's ClusterRole and ClusterRoleBinding
pub const CLUSTER_ROLE_NAME: &str = "system:accounting-exporter";

/// Namespace of the exporter's service account in the shoot
pub const SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";

pub(super) fn cluster_role() -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(strings(&[
                    "namespaces",
                    "pods",
                    "persistentvolumes",
                    "persistentvolumeclaims",
                ])),
                verbs: strings(&["get", "list", "watch"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["storage.k8s.io"])),
                resources: Some(strings(&["storageclasses"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["metal-stack.io"])),
                resources: Some(strings(&["firewalls"])),
                verbs: strings(&["get"]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(strings(&["firewall.metal-stack.io"])),
                resources: Some(strings(&["firewallmonitors"])),
                verbs: strings(&["get", "list", "watch"]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

pub(super) fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: EXPORTER_NAME.to_string(),
            namespace: Some(SERVICE_ACCOUNT_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}
