//! Cluster API client
//!
//! The handful of Kubernetes operations the mesh bootstrap needs beyond chart
//! installs. Writes go through server-side apply so reruns converge instead of
//! conflicting.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, ServiceAccount};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::credentials::{self, ClientContext};
use crate::{Error, Result};

/// Field manager for every server-side apply
pub const FIELD_MANAGER: &str = "crossmesh";

/// Label marking a secret as a remote cluster credential for the mesh
pub const MULTI_CLUSTER_LABEL: &str = "istio/multiCluster";

/// Annotation naming the cluster a remote secret points at
pub const REMOTE_CLUSTER_ANNOTATION: &str = "networking.istio.io/cluster";

/// Name of the remote secret for a peer cluster
pub fn remote_secret_name(peer: &str) -> String {
    format!("istio-remote-secret-{}", peer)
}

/// Kubernetes operations used while bootstrapping a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update a namespace carrying `labels`
    async fn create_namespace(
        &self,
        context: &ClientContext,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// True when at least one pod matches `selector` in `namespace` and every
    /// matching pod reports Ready
    async fn label_selector_ready(
        &self,
        context: &ClientContext,
        namespace: &str,
        selector: &str,
    ) -> Result<bool>;

    /// Mint a bound token for a service account
    async fn issue_token(
        &self,
        context: &ClientContext,
        namespace: &str,
        service_account: &str,
        ttl: Duration,
    ) -> Result<credentials::Secret>;

    /// Store `kubeconfig` for `peer` so the control plane in `namespace`
    /// discovers endpoints in the peer cluster
    async fn apply_remote_secret(
        &self,
        context: &ClientContext,
        namespace: &str,
        peer: &str,
        kubeconfig: &str,
    ) -> Result<()>;
}

/// [`ClusterApi`] backed by kube-rs
#[derive(Clone, Debug, Default)]
pub struct KubeClusterApi;

impl KubeClusterApi {
    /// Create a client factory
    pub fn new() -> Self {
        Self
    }

    async fn client(&self, context: &ClientContext) -> Result<Client> {
        let yaml = context.to_kubeconfig_yaml()?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml).map_err(|e| {
            Error::credential(format!("invalid kubeconfig for {}: {}", context.name(), e))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::credential(format!(
                    "failed to load client config for {}: {}",
                    context.name(),
                    e
                ))
            })?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self, context, labels), fields(cluster = %context.name()))]
    async fn create_namespace(
        &self,
        context: &ClientContext,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let client = self.client(context).await?;
        let namespaces: Api<Namespace> = Api::all(client);
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels }
        });
        namespaces
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&ns))
            .await?;
        info!(namespace = %name, "Namespace applied");
        Ok(())
    }

    async fn label_selector_ready(
        &self,
        context: &ClientContext,
        namespace: &str,
        selector: &str,
    ) -> Result<bool> {
        let client = self.client(context).await?;
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        let ready = pods_ready(&list.items);
        debug!(
            cluster = %context.name(),
            namespace,
            selector,
            pods = list.items.len(),
            ready,
            "Checked workload readiness"
        );
        Ok(ready)
    }

    #[instrument(skip(self, context), fields(cluster = %context.name()))]
    async fn issue_token(
        &self,
        context: &ClientContext,
        namespace: &str,
        service_account: &str,
        ttl: Duration,
    ) -> Result<credentials::Secret> {
        let client = self.client(context).await?;
        let accounts: Api<ServiceAccount> = Api::namespaced(client, namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(ttl.as_secs() as i64),
                ..Default::default()
            },
            ..Default::default()
        };
        let issued = accounts
            .create_token_request(service_account, &PostParams::default(), &request)
            .await?;
        let token = issued
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::credential(format!(
                    "no token issued for {}/{} on {}",
                    namespace,
                    service_account,
                    context.name()
                ))
            })?;
        debug!(service_account, ttl_secs = ttl.as_secs(), "Issued service account token");
        Ok(credentials::Secret::new(token))
    }

    #[instrument(skip(self, context, kubeconfig), fields(cluster = %context.name()))]
    async fn apply_remote_secret(
        &self,
        context: &ClientContext,
        namespace: &str,
        peer: &str,
        kubeconfig: &str,
    ) -> Result<()> {
        let client = self.client(context).await?;
        let secrets: Api<Secret> = Api::namespaced(client, namespace);
        let name = remote_secret_name(peer);
        let secret = remote_secret_manifest(&name, namespace, peer, kubeconfig);
        secrets
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        info!(peer = %peer, secret = %name, "Remote secret applied");
        Ok(())
    }
}

fn remote_secret_manifest(
    name: &str,
    namespace: &str,
    peer: &str,
    kubeconfig: &str,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { MULTI_CLUSTER_LABEL: "true" },
            "annotations": { REMOTE_CLUSTER_ANNOTATION: peer }
        },
        "type": "Opaque",
        "stringData": { peer: kubeconfig }
    })
}

/// True when `pods` is non-empty and every pod has a Ready=True condition
pub fn pods_ready(pods: &[Pod]) -> bool {
    !pods.is_empty()
        && pods.iter().all(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .map(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod(ready: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_pods_is_not_ready() {
        assert!(!pods_ready(&[]));
    }

    #[test]
    fn test_all_pods_must_be_ready() {
        assert!(pods_ready(&[pod(Some("True")), pod(Some("True"))]));
        assert!(!pods_ready(&[pod(Some("True")), pod(Some("False"))]));
        assert!(!pods_ready(&[pod(None)]));
        assert!(!pods_ready(&[Pod::default()]));
    }

    #[test]
    fn test_remote_secret_is_labeled_for_discovery() {
        let secret = remote_secret_manifest(
            &remote_secret_name("mesh-west"),
            "istio-system",
            "mesh-west",
            "apiVersion: v1\n",
        );
        assert_eq!(secret["metadata"]["name"], "istio-remote-secret-mesh-west");
        assert_eq!(secret["metadata"]["labels"]["istio/multiCluster"], "true");
        assert_eq!(
            secret["metadata"]["annotations"]["networking.istio.io/cluster"],
            "mesh-west"
        );
        assert_eq!(secret["stringData"]["mesh-west"], "apiVersion: v1\n");
    }
}
