//! Seed firewall egress rule for the accounting API
//!
//! The exporters in every control-plane namespace talk to the accounting API
//! on one TCP port. A single `ClusterwideNetworkPolicy` in the seed's
//! `firewall` namespace opens that port; it is applied once at start.

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::kube_utils::build_api_resource;
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// apiVersion of metal-stack's firewall policies
pub const CLUSTERWIDE_NETWORK_POLICY_API_VERSION: &str = "metal-stack.io/v1";
/// Namespace the firewall controller reads policies from
pub const FIREWALL_NAMESPACE: &str = "firewall";
/// Name of the egress policy
pub const EGRESS_POLICY_NAME: &str = "egress-allow-accounting-api";

/// Policy allowing TCP egress to `port` on any address
pub fn build_egress_policy(port: u16) -> serde_json::Value {
    json!({
        "apiVersion": CLUSTERWIDE_NETWORK_POLICY_API_VERSION,
        "kind": "ClusterwideNetworkPolicy",
        "metadata": {
            "name": EGRESS_POLICY_NAME,
            "namespace": FIREWALL_NAMESPACE,
        },
        "spec": {
            "egress": [{
                "ports": [{"port": port, "protocol": "TCP"}],
                "to": [{"cidr": "0.0.0.0/0"}],
            }],
        },
    })
}

/// Server-side apply the egress policy, retrying transient API failures
pub async fn ensure_egress_policy(
    client: &Client,
    port: u16,
    retry: &RetryConfig,
) -> Result<(), Error> {
    let ar = build_api_resource(
        CLUSTERWIDE_NETWORK_POLICY_API_VERSION,
        "ClusterwideNetworkPolicy",
        "clusterwidenetworkpolicies",
    );
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), FIREWALL_NAMESPACE, &ar);
    let policy = build_egress_policy(port);
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let (api, policy, params) = (&api, &policy, &params);

    retry_with_backoff_if(
        retry,
        "apply egress policy",
        || async move {
            api.patch(EGRESS_POLICY_NAME, params, &Patch::Apply(policy))
                .await
                .map_err(Error::from)
        },
        Error::is_retryable,
    )
    .await?;

    info!(
        port,
        namespace = FIREWALL_NAMESPACE,
        name = EGRESS_POLICY_NAME,
        "egress policy ensured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_the_configured_port_only() {
        let policy = build_egress_policy(9000);
        let egress = policy["spec"]["egress"].as_array().unwrap();
        assert_eq!(egress.len(), 1);
        assert_eq!(egress[0]["ports"], json!([{"port": 9000, "protocol": "TCP"}]));
        assert_eq!(egress[0]["to"], json!([{"cidr": "0.0.0.0/0"}]));
    }

    #[test]
    fn lives_in_the_firewall_namespace() {
        let policy = build_egress_policy(443);
        assert_eq!(policy["metadata"]["namespace"], "firewall");
        assert_eq!(policy["metadata"]["name"], "egress-allow-accounting-api");
        assert_eq!(policy["kind"], "ClusterwideNetworkPolicy");
    }
}
