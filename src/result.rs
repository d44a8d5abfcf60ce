//! Run results
//!
//! Everything a caller needs after a run, as data: per-cloud status, the
//! cluster handle or the first fatal error, mesh install outcome, node reports
//! and the commands an operator would type next. Nothing here is executed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cluster::{ClusterSpec, ClusterSummary};
use crate::graph::{GraphReport, NodeReport, NodeState};
use crate::mesh::trust::TrustLink;
use crate::mesh::{BranchNodes, BranchState, MESH_NAMESPACE};

/// Outcome of a run or of one branch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every required node succeeded
    Succeeded,
    /// At least one required node failed or was skipped
    Failed,
    /// The run was cancelled before every node started
    Cancelled,
}

/// First fatal error of a branch
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchError {
    /// Node that failed
    pub node: String,
    /// Error category
    pub kind: String,
    /// Error message
    pub message: String,
}

/// Mesh install steps of one branch
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshOutcome {
    /// Network ID assigned to the cluster
    pub network: String,
    /// Mesh namespace creation
    pub namespace: NodeState,
    /// Base and control plane install
    pub control_plane: NodeState,
    /// Control plane readiness
    pub control_plane_ready: NodeState,
    /// Gateway install
    pub gateway: NodeState,
    /// Gateway readiness
    pub gateway_ready: NodeState,
}

/// Result of one cloud target
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResult {
    /// Cloud identifier
    pub cloud: String,
    /// Cluster name
    pub cluster_name: String,
    /// Branch status
    pub status: RunStatus,
    /// API server URL, once the cluster exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Connection details, without credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<ClusterSummary>,
    /// First fatal error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BranchError>,
    /// Mesh install steps
    pub mesh: MeshOutcome,
    /// Every node of the branch
    pub nodes: Vec<NodeReport>,
    /// Suggested operator commands
    pub commands: Vec<String>,
}

impl BranchResult {
    /// Fold a branch's graph report into its result
    pub fn from_report(
        spec: &ClusterSpec,
        network: &str,
        state: &BranchState,
        ids: &BranchNodes,
        report: &GraphReport,
    ) -> Self {
        let nodes: Vec<NodeReport> = report.branch(&spec.cloud).cloned().collect();
        let state_of = |id: &str| {
            nodes
                .iter()
                .find(|n| n.id == id)
                .map(|n| n.state)
                .unwrap_or(NodeState::Pending)
        };

        let error = nodes
            .iter()
            .find(|n| n.state == NodeState::Failed && n.is_fatal())
            .map(|n| BranchError {
                node: n.id.clone(),
                kind: n.error_kind.unwrap_or("Error").to_string(),
                message: n.message.clone().unwrap_or_default(),
            });

        let status = if nodes.iter().all(|n| !n.is_fatal()) {
            RunStatus::Succeeded
        } else if error.is_none() && report.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };

        let handle = state.handle().map(ClusterSummary::from);
        Self {
            cloud: spec.cloud.clone(),
            cluster_name: spec.name.clone(),
            status,
            endpoint: handle.as_ref().map(|h| h.endpoint.clone()),
            commands: handle
                .as_ref()
                .map(|h| suggested_commands(&h.cluster_name))
                .unwrap_or_default(),
            handle,
            error,
            mesh: MeshOutcome {
                network: network.to_string(),
                namespace: state_of(&ids.namespace),
                control_plane: state_of(&ids.control_plane),
                control_plane_ready: state_of(&ids.control_plane_ready),
                gateway: state_of(&ids.gateway),
                gateway_ready: state_of(&ids.gateway_ready),
            },
            nodes,
        }
    }
}

/// Result of a whole run
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Overall status
    pub status: RunStatus,
    /// Mesh ID shared by every cluster
    pub mesh_id: String,
    /// Results keyed by cloud identifier
    pub branches: BTreeMap<String, BranchResult>,
    /// Remote secret exchanges between finished branches
    pub trust_links: Vec<TrustLink>,
}

impl RunResult {
    /// Assemble the result; the overall status is derived from the parts
    pub fn new(
        mesh_id: impl Into<String>,
        branches: BTreeMap<String, BranchResult>,
        trust_links: Vec<TrustLink>,
        cancelled: bool,
    ) -> Self {
        let all_ok = branches.values().all(|b| b.status == RunStatus::Succeeded)
            && trust_links.iter().all(|l| l.state == NodeState::Succeeded);
        let status = if cancelled {
            RunStatus::Cancelled
        } else if all_ok {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        Self {
            status,
            mesh_id: mesh_id.into(),
            branches,
            trust_links,
        }
    }

    /// True when every required node across every graph succeeded
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Result for one cloud
    pub fn branch(&self, cloud: &str) -> Option<&BranchResult> {
        self.branches.get(cloud)
    }
}

/// Commands to inspect a cluster once its context is in the local kubeconfig
pub fn suggested_commands(cluster_name: &str) -> Vec<String> {
    vec![
        format!("kubectl config use-context {}", cluster_name),
        format!("kubectl --context {} get nodes", cluster_name),
        format!("kubectl --context {} get pods -n {}", cluster_name, MESH_NAMESPACE),
    ]
}
