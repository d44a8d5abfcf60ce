//! Per-cluster mesh install chain
//!
//! ```text
//! cluster → namespace → control-plane → control-plane-ready → gateway → gateway-ready
//! ```
//!
//! The cluster node is the driver's; everything after it is added here. Nodes
//! read the branch's client context from a set-once cell filled by the
//! cluster node.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{info, instrument};

use super::values::{base_values, control_plane_values, gateway_values};
use super::{
    MeshIdentity, BASE_RELEASE, CONTROL_PLANE_RELEASE, CONTROL_PLANE_SELECTOR, GATEWAY_RELEASE,
    GATEWAY_SELECTOR, MESH_NAMESPACE, NETWORK_LABEL,
};
use crate::cluster::ClusterHandle;
use crate::cluster_api::ClusterApi;
use crate::config::ChartsConfig;
use crate::credentials::ClientContext;
use crate::graph::{Criticality, GraphNode, Operation, ResourceGraph};
use crate::install::{ChartRef, PackageInstaller, ReleaseRequest};
use crate::readiness::{ReadinessVerifier, WorkloadSelector};
use crate::{Error, Result};

/// Install settings shared by every branch
#[derive(Clone, Debug)]
pub struct MeshSettings {
    /// Chart references
    pub charts: ChartsConfig,
    /// Bound on each chart install
    pub install_timeout: Duration,
    /// Bound on each readiness check
    pub verification_timeout: Duration,
    /// Gateway readiness failures are logged instead of failing the branch
    pub best_effort_proxy_check: bool,
}

/// Values a branch produces once and reads afterwards
#[derive(Debug, Default)]
pub struct BranchState {
    handle: OnceLock<ClusterHandle>,
    context: OnceLock<Arc<ClientContext>>,
}

impl BranchState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the cluster handle; fails if one was already recorded
    pub fn set_handle(&self, handle: ClusterHandle) -> Result<()> {
        self.handle.set(handle).map_err(|h| {
            Error::validation(format!("handle for {} already set", h.cluster_name))
        })
    }

    /// Record the client context; fails if one was already recorded
    pub fn set_context(&self, context: Arc<ClientContext>) -> Result<()> {
        self.context.set(context).map_err(|c| {
            Error::validation(format!("context for {} already set", c.name()))
        })
    }

    /// Cluster handle, once the cluster node succeeded
    pub fn handle(&self) -> Option<&ClusterHandle> {
        self.handle.get()
    }

    /// Client context, once the cluster node succeeded
    pub fn context(&self) -> Option<Arc<ClientContext>> {
        self.context.get().cloned()
    }

    fn require_context(&self) -> Result<Arc<ClientContext>> {
        self.context()
            .ok_or_else(|| Error::credential("client context not resolved for this branch"))
    }
}

/// Node ids of one branch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchNodes {
    /// Cluster creation and credential resolution
    pub cluster: String,
    /// Mesh namespace
    pub namespace: String,
    /// Base and control plane charts
    pub control_plane: String,
    /// Control plane readiness
    pub control_plane_ready: String,
    /// East-west gateway chart
    pub gateway: String,
    /// Gateway readiness
    pub gateway_ready: String,
}

impl BranchNodes {
    /// Ids for the branch keyed by `branch`
    pub fn for_branch(branch: &str) -> Self {
        Self {
            cluster: format!("{}/cluster", branch),
            namespace: format!("{}/namespace", branch),
            control_plane: format!("{}/control-plane", branch),
            control_plane_ready: format!("{}/control-plane-ready", branch),
            gateway: format!("{}/gateway", branch),
            gateway_ready: format!("{}/gateway-ready", branch),
        }
    }
}

/// Adds the mesh install chain of a cluster to a resource graph
#[derive(Clone)]
pub struct MeshBootstrapper {
    installer: Arc<dyn PackageInstaller>,
    api: Arc<dyn ClusterApi>,
    verifier: ReadinessVerifier,
    identity: Arc<MeshIdentity>,
    settings: Arc<MeshSettings>,
}

impl MeshBootstrapper {
    /// Create a bootstrapper for one run
    pub fn new(
        installer: Arc<dyn PackageInstaller>,
        api: Arc<dyn ClusterApi>,
        verifier: ReadinessVerifier,
        identity: Arc<MeshIdentity>,
        settings: MeshSettings,
    ) -> Self {
        Self {
            installer,
            api,
            verifier,
            identity,
            settings: Arc::new(settings),
        }
    }

    /// Shared mesh identity
    pub fn identity(&self) -> &Arc<MeshIdentity> {
        &self.identity
    }

    /// Add the namespace, control plane, gateway and readiness nodes of
    /// `branch`, all downstream of the node `after`.
    pub fn add_branch(
        &self,
        graph: &mut ResourceGraph,
        branch: &str,
        cluster_name: &str,
        state: Arc<BranchState>,
        after: &str,
    ) -> Result<BranchNodes> {
        let ids = BranchNodes::for_branch(branch);
        let network = self.identity.network_for(branch)?.to_string();

        let step = BranchStep {
            this: self.clone(),
            state,
            cluster_name: cluster_name.to_string(),
            network,
        };

        let s = step.clone();
        graph.add_node(
            GraphNode::new(&ids.namespace, Operation::new(move || s.create_namespace()))
                .branch(branch)
                .depends_on([after]),
        )?;

        let s = step.clone();
        graph.add_node(
            GraphNode::new(&ids.control_plane, Operation::new(move || s.install_control_plane()))
                .branch(branch)
                .depends_on([&ids.namespace]),
        )?;

        let s = step.clone();
        let (key, value) = CONTROL_PLANE_SELECTOR;
        let selector = WorkloadSelector::new(MESH_NAMESPACE, key, value);
        graph.add_node(
            GraphNode::new(&ids.control_plane_ready, Operation::new(move || s.verify(selector)))
                .branch(branch)
                .depends_on([&ids.control_plane]),
        )?;

        let s = step.clone();
        graph.add_node(
            GraphNode::new(&ids.gateway, Operation::new(move || s.install_gateway()))
                .branch(branch)
                .depends_on([&ids.control_plane_ready]),
        )?;

        let proxy_check = if self.settings.best_effort_proxy_check {
            Criticality::BestEffort
        } else {
            Criticality::Required
        };
        let (key, value) = GATEWAY_SELECTOR;
        let selector = WorkloadSelector::new(MESH_NAMESPACE, key, value);
        graph.add_node(
            GraphNode::new(&ids.gateway_ready, Operation::new(move || step.verify(selector)))
                .branch(branch)
                .criticality(proxy_check)
                .depends_on([&ids.gateway]),
        )?;

        Ok(ids)
    }
}

/// Everything one node of a branch needs, cloned into each operation
#[derive(Clone)]
struct BranchStep {
    this: MeshBootstrapper,
    state: Arc<BranchState>,
    cluster_name: String,
    network: String,
}

impl BranchStep {
    fn release(
        &self,
        release: &str,
        chart: ChartRef,
        values: serde_json::Value,
    ) -> ReleaseRequest {
        ReleaseRequest {
            release: release.to_string(),
            chart,
            namespace: MESH_NAMESPACE.to_string(),
            values,
            timeout: self.this.settings.install_timeout,
        }
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name, network = %self.network))]
    async fn create_namespace(self) -> Result<()> {
        let context = self.state.require_context()?;
        let labels = BTreeMap::from([(NETWORK_LABEL.to_string(), self.network.clone())]);
        self.this
            .api
            .create_namespace(&context, MESH_NAMESPACE, &labels)
            .await
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn install_control_plane(self) -> Result<()> {
        let context = self.state.require_context()?;
        let charts = &self.this.settings.charts;

        let base = self.release(BASE_RELEASE, charts.base_chart(), base_values());
        self.this.installer.install_or_upgrade(&context, &base).await?;

        let values = control_plane_values(&self.this.identity, &self.cluster_name, &self.network);
        let istiod = self.release(CONTROL_PLANE_RELEASE, charts.control_plane_chart(), values);
        self.this.installer.install_or_upgrade(&context, &istiod).await?;

        info!(mesh_id = %self.this.identity.mesh_id(), "Control plane installed");
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn install_gateway(self) -> Result<()> {
        let context = self.state.require_context()?;
        let request = self.release(
            GATEWAY_RELEASE,
            self.this.settings.charts.gateway_chart(),
            gateway_values(&self.network),
        );
        self.this.installer.install_or_upgrade(&context, &request).await
    }

    async fn verify(self, selector: WorkloadSelector) -> Result<()> {
        let context = self.state.require_context()?;
        let timeout = self.this.settings.verification_timeout;
        self.this
            .verifier
            .wait_for_condition(&context, &selector, timeout)
            .await?
            .into_result(&selector, timeout)
    }
}
