//! In-memory collaborators

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crossmesh::cluster::{AuthDescriptor, ClusterHandle, ClusterSpec};
use crossmesh::cluster_api::ClusterApi;
use crossmesh::credentials::{ClientContext, Secret};
use crossmesh::error::BackendError;
use crossmesh::install::{PackageInstaller, ReleaseRequest};
use crossmesh::provider::BackendAdapter;
use crossmesh::{Error, Result};

/// A cloud that keeps its clusters in memory
#[derive(Default)]
pub struct FakeCloud {
    clusters: Mutex<BTreeMap<String, ClusterHandle>>,
    creations: Mutex<usize>,
    fail_with: Option<BackendError>,
    delay: Duration,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every creation request is rejected with `err`
    pub fn failing(err: BackendError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(err),
            ..Default::default()
        })
    }

    /// Creation takes `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn creations(&self) -> usize {
        *self.creations.lock().unwrap()
    }
}

#[async_trait]
impl BackendAdapter for FakeCloud {
    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        if let Some(existing) = self.describe_cluster(spec).await? {
            return Ok(existing);
        }
        if let Some(err) = &self.fail_with {
            return Err(Error::Backend(err.clone()));
        }
        tokio::time::sleep(self.delay).await;

        let handle = ClusterHandle {
            cluster_name: spec.name.clone(),
            endpoint: format!("https://{}.{}.example", spec.name, spec.region),
            ca_bundle: STANDARD.encode("-----BEGIN CERTIFICATE-----\nZmFrZQ==\n-----END CERTIFICATE-----\n"),
            auth: AuthDescriptor::Token {
                token: Secret::new(format!("admin-{}", spec.name)),
            },
            kubernetes_version: Some(spec.kubernetes_version.clone()),
            node_count: Some(spec.node_count),
        };
        *self.creations.lock().unwrap() += 1;
        self.clusters
            .lock()
            .unwrap()
            .insert(spec.name.clone(), handle.clone());
        Ok(handle)
    }

    async fn describe_cluster(&self, spec: &ClusterSpec) -> Result<Option<ClusterHandle>> {
        Ok(self.clusters.lock().unwrap().get(&spec.name).cloned())
    }
}

/// Records every release it is asked to install
#[derive(Default)]
pub struct FakeInstaller {
    releases: Mutex<Vec<(String, ReleaseRequest)>>,
}

impl FakeInstaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Release names installed on `cluster`, in order
    pub fn releases_on(&self, cluster: &str) -> Vec<String> {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == cluster)
            .map(|(_, r)| r.release.clone())
            .collect()
    }

    /// Values of a release on `cluster`
    pub fn values_of(&self, cluster: &str, release: &str) -> Option<serde_json::Value> {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .find(|(c, r)| c == cluster && r.release == release)
            .map(|(_, r)| r.values.clone())
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn install_or_upgrade(&self, context: &ClientContext, request: &ReleaseRequest) -> Result<()> {
        self.releases
            .lock()
            .unwrap()
            .push((context.name().to_string(), request.clone()));
        Ok(())
    }
}

/// Cluster API whose control planes are always ready and whose gateways are
/// ready only when configured so
pub struct FakeClusterApi {
    gateways_ready: bool,
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    remote_secrets: Mutex<BTreeSet<(String, String)>>,
}

impl FakeClusterApi {
    pub fn new(gateways_ready: bool) -> Arc<Self> {
        Arc::new(Self {
            gateways_ready,
            namespaces: Mutex::new(BTreeMap::new()),
            remote_secrets: Mutex::new(BTreeSet::new()),
        })
    }

    /// Labels of the mesh namespace on `cluster`
    pub fn namespace_labels(&self, cluster: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces.lock().unwrap().get(cluster).cloned()
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.lock().unwrap().len()
    }

    /// (cluster holding the secret, peer it describes)
    pub fn remote_secrets(&self) -> Vec<(String, String)> {
        self.remote_secrets.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn create_namespace(
        &self,
        context: &ClientContext,
        _name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.namespaces
            .lock()
            .unwrap()
            .insert(context.name().to_string(), labels.clone());
        Ok(())
    }

    async fn label_selector_ready(
        &self,
        _context: &ClientContext,
        _namespace: &str,
        selector: &str,
    ) -> Result<bool> {
        Ok(selector == "app=istiod" || self.gateways_ready)
    }

    async fn issue_token(
        &self,
        context: &ClientContext,
        _namespace: &str,
        _service_account: &str,
        _ttl: Duration,
    ) -> Result<Secret> {
        Ok(Secret::new(format!("reader-{}", context.name())))
    }

    async fn apply_remote_secret(
        &self,
        context: &ClientContext,
        _namespace: &str,
        peer: &str,
        kubeconfig: &str,
    ) -> Result<()> {
        if !kubeconfig.contains(&format!("reader-{}", peer)) {
            return Err(Error::credential(format!("secret for {} has wrong token", peer)));
        }
        self.remote_secrets
            .lock()
            .unwrap()
            .insert((context.name().to_string(), peer.to_string()));
        Ok(())
    }
}
