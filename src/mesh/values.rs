//! Helm values for the mesh charts

use serde_json::{json, Value};

use super::{
    MeshIdentity, GATEWAY_SELECTOR, MESH_NAMESPACE, MTLS_PORT, NETWORK_LABEL, STATUS_PORT,
};

/// Values for the base chart (CRDs and cluster-wide resources)
pub fn base_values() -> Value {
    json!({
        "global": { "istioNamespace": MESH_NAMESPACE }
    })
}

/// Values for the control plane of one primary cluster
///
/// External istiod stays off: every cluster runs its own control plane.
pub fn control_plane_values(identity: &MeshIdentity, cluster_name: &str, network: &str) -> Value {
    json!({
        "global": {
            "meshID": identity.mesh_id(),
            "multiCluster": { "clusterName": cluster_name },
            "network": network,
            "externalIstiod": false,
            "istioNamespace": MESH_NAMESPACE
        },
        "meshConfig": { "trustDomain": identity.trust_domain() },
        "pilot": {
            "env": { "EXTERNAL_ISTIOD": false }
        }
    })
}

/// Values for the east-west gateway of one network
pub fn gateway_values(network: &str) -> Value {
    let (selector_key, selector_value) = GATEWAY_SELECTOR;
    json!({
        "labels": {
            selector_key: selector_value,
            "app": "istio-eastwestgateway",
            NETWORK_LABEL: network
        },
        "networkGateway": network,
        "replicaCount": 1,
        "autoscaling": { "enabled": false },
        "strategy": {
            "type": "RollingUpdate",
            "rollingUpdate": { "maxUnavailable": 0, "maxSurge": 1 }
        },
        "resources": {
            "requests": { "cpu": "100m", "memory": "128Mi" },
            "limits": { "cpu": "500m", "memory": "512Mi" }
        },
        "service": {
            "type": "LoadBalancer",
            "ports": [
                {
                    "name": "status-port",
                    "port": STATUS_PORT,
                    "targetPort": STATUS_PORT,
                    "protocol": "TCP"
                },
                {
                    "name": "tls",
                    "port": MTLS_PORT,
                    "targetPort": MTLS_PORT,
                    "protocol": "TCP"
                }
            ]
        },
        "env": {
            "ISTIO_META_REQUESTED_NETWORK_VIEW": network
        }
    })
}
