//! Objects applied to the shoot's control-plane namespace on the seed

use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, KeyToPath, LocalObjectReference, PodSpec,
    PodTemplateSpec, Probe, ProjectedVolumeSource, Secret, SecretProjection, SecretVolumeSource,
    Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use super::{AssemblyInput, EXPORTER_NAME};
use crate::Error;

/// Secret holding the exporter's client TLS material
pub const TLS_SECRET_NAME: &str = "accounting-exporter-tls";
/// Secret holding the exporter's registry credential
pub const REGISTRY_SECRET_NAME: &str = "accounting-exporter-registry-credentials";
/// Shoot access secret whose token the exporter authenticates with
pub const ACCESS_SECRET_NAME: &str = "shoot-access-accounting-exporter";

/// Container port serving the health endpoint
pub const HEALTH_PORT: i32 = 3000;

/// Directory the generic kubeconfig is projected into
pub const GENERIC_KUBECONFIG_DIR: &str = "/var/run/secrets/gardener.cloud/shoot/generic-kubeconfig";

const CERTS_VOLUME: &str = "certs";
const CERTS_DIR: &str = "/certs";
const KUBECONFIG_VOLUME: &str = "kubeconfig";

const NETWORK_POLICY_LABELS: [&str; 5] = [
    "networking.gardener.cloud/from-prometheus",
    "networking.gardener.cloud/to-dns",
    "networking.gardener.cloud/to-shoot-apiserver",
    "networking.gardener.cloud/to-public-networks",
    "networking.resources.gardener.cloud/to-kube-apiserver-tcp-443",
];

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([("k8s-app".to_string(), EXPORTER_NAME.to_string())])
}

fn pod_labels() -> BTreeMap<String, String> {
    let mut labels = labels();
    labels.insert("app".to_string(), EXPORTER_NAME.to_string());
    for label in NETWORK_POLICY_LABELS {
        labels.insert(label.to_string(), "allowed".to_string());
    }
    labels
}

/// Secret whose token the orchestrator's token requestor keeps filled
pub fn shoot_access_secret(namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(ACCESS_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (
                    "resources.gardener.cloud/purpose".to_string(),
                    "token-requestor".to_string(),
                ),
                ("resources.gardener.cloud/class".to_string(), "shoot".to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (
                    "serviceaccount.resources.gardener.cloud/name".to_string(),
                    EXPORTER_NAME.to_string(),
                ),
                (
                    "serviceaccount.resources.gardener.cloud/namespace".to_string(),
                    super::rbac::SERVICE_ACCOUNT_NAMESPACE.to_string(),
                ),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

pub(super) fn tls_secret(input: &AssemblyInput<'_>) -> Secret {
    let accounting = &input.config.accounting;
    Secret {
        metadata: ObjectMeta {
            name: Some(TLS_SECRET_NAME.to_string()),
            namespace: Some(input.namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("ca.pem".to_string(), accounting.ca.clone()),
            ("client.pem".to_string(), accounting.cert.clone()),
            ("client-key.pem".to_string(), accounting.key.clone()),
        ])),
        ..Default::default()
    }
}

/// Registry credential secret, or `None` when no credential is configured
pub(super) fn registry_secret(input: &AssemblyInput<'_>) -> Result<Option<Secret>, Error> {
    let Some(encoded) = input.config.pull_credentials() else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::config(format!("imagePullSecret is not valid base64: {e}")))?;

    Ok(Some(Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET_NAME.to_string()),
            namespace: Some(input.namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                REGISTRY_SECRET_NAME.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(decoded),
        )])),
        ..Default::default()
    }))
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn health_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::String("health".to_string()),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn deployment(
    input: &AssemblyInput<'_>,
    image: String,
    with_pull_secret: bool,
) -> Result<Deployment, Error> {
    let accounting = &input.config.accounting;
    let replicas = if input.cluster.hibernated { 0 } else { 1 };

    let container = Container {
        name: EXPORTER_NAME.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("health".to_string()),
            container_port: HEALTH_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(health_probe()),
        liveness_probe: Some(Probe {
            failure_threshold: Some(1),
            initial_delay_seconds: Some(120),
            ..health_probe()
        }),
        env: Some(vec![
            env("KUBE_COUNTER_BIND_ADDR", "0.0.0.0"),
            env(
                "KUBE_COUNTER_KUBECONFIG",
                format!("{GENERIC_KUBECONFIG_DIR}/kubeconfig"),
            ),
            env("KUBE_COUNTER_PARTITION", &input.infra.partition_id),
            env("KUBE_COUNTER_TENANT", &input.project.tenant_id),
            env("KUBE_COUNTER_PROJECT_ID", &input.infra.project_id),
            env("KUBE_COUNTER_PROJECT_NAME", &input.project.name),
            env("KUBE_COUNTER_CLUSTER_ID", &input.cluster.uid),
            env("KUBE_COUNTER_CLUSTER_NAME", &input.cluster.name),
            env("KUBE_COUNTER_ACCOUNTING_API_HOSTNAME", &accounting.hostname),
            env("KUBE_COUNTER_ACCOUNTING_API_PORT", &accounting.port),
            env("KUBE_COUNTER_NETWORK_TRAFFIC_ENABLED", "true"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: CERTS_VOLUME.to_string(),
            mount_path: CERTS_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(EXPORTER_NAME.to_string()),
            namespace: Some(input.namespace.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels()),
                    annotations: Some(BTreeMap::from([(
                        "scheduler.alpha.kubernetes.io/critical-pod".to_string(),
                        String::new(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets: with_pull_secret.then(|| {
                        vec![LocalObjectReference {
                            name: REGISTRY_SECRET_NAME.to_string(),
                        }]
                    }),
                    volumes: Some(vec![Volume {
                        name: CERTS_VOLUME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(TLS_SECRET_NAME.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    inject_generic_kubeconfig(
        &mut deployment,
        &input.cluster.generic_kubeconfig_secret,
        &input.access.token_secret,
    )?;
    Ok(deployment)
}

/// Mount the generic token kubeconfig into every container of the pod
///
/// The kubeconfig and the shoot access token are projected into one
/// directory so the kubeconfig's token file reference resolves.
pub(super) fn inject_generic_kubeconfig(
    deployment: &mut Deployment,
    kubeconfig_secret: &str,
    token_secret: &str,
) -> Result<(), Error> {
    let pod = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| Error::internal("deployment has no pod spec"))?;

    pod.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: KUBECONFIG_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o644),
            sources: Some(vec![
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: kubeconfig_secret.to_string(),
                        items: Some(vec![KeyToPath {
                            key: "kubeconfig".to_string(),
                            path: "kubeconfig".to_string(),
                            ..Default::default()
                        }]),
                        optional: Some(false),
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: token_secret.to_string(),
                        items: Some(vec![KeyToPath {
                            key: "token".to_string(),
                            path: "token".to_string(),
                            ..Default::default()
                        }]),
                        optional: Some(false),
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    });

    for container in &mut pod.containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: KUBECONFIG_VOLUME.to_string(),
                mount_path: GENERIC_KUBECONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_secret_requests_token_for_exporter() {
        let secret = shoot_access_secret("shoot--p1--c1");
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels["resources.gardener.cloud/purpose"], "token-requestor");
        let annotations = secret.metadata.annotations.unwrap();
        assert_eq!(
            annotations["serviceaccount.resources.gardener.cloud/name"],
            "accounting-exporter"
        );
        assert!(secret.data.is_none());
    }

    #[test]
    fn pod_labels_open_required_network_paths() {
        let labels = pod_labels();
        assert_eq!(labels["app"], "accounting-exporter");
        assert_eq!(labels["networking.gardener.cloud/to-dns"], "allowed");
        assert_eq!(
            labels["networking.resources.gardener.cloud/to-kube-apiserver-tcp-443"],
            "allowed"
        );
    }
}
