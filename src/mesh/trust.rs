//! Cross-cluster trust wiring
//!
//! Each control plane watches its peers through remote secrets: a kubeconfig
//! for the peer, authenticated as the peer's reader service account, stored in
//! the local mesh namespace. One node per ordered pair of finished branches.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use super::MESH_NAMESPACE;
use crate::cluster_api::ClusterApi;
use crate::credentials::ClientContext;
use crate::graph::{GraphNode, NodeReport, NodeState, Operation, ResourceGraph};
use crate::Result;

/// Service account the base chart creates for remote endpoint discovery
pub const READER_SERVICE_ACCOUNT: &str = "istio-reader-service-account";

/// Lifetime of the token embedded in a remote secret
pub const REMOTE_TOKEN_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A branch whose mesh install succeeded
#[derive(Clone, Debug)]
pub struct ReadyBranch {
    /// Branch key (cloud identifier)
    pub branch: String,
    /// Cluster name, used as the remote cluster ID
    pub cluster_name: String,
    /// Client context for the cluster
    pub context: Arc<ClientContext>,
}

/// Outcome of one remote secret
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustLink {
    /// Branch whose control plane received the secret
    pub from: String,
    /// Branch the secret describes
    pub to: String,
    /// Final node state
    pub state: NodeState,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Node id of the link installing `to`'s secret into `from`
pub fn link_id(from: &str, to: &str) -> String {
    format!("trust/{}->{}", from, to)
}

/// Graph with one node per ordered pair of `branches`
///
/// Empty when fewer than two branches are ready.
pub fn build_trust_graph(
    api: Arc<dyn ClusterApi>,
    branches: &[ReadyBranch],
) -> Result<ResourceGraph> {
    let mut graph = ResourceGraph::new("trust");
    if branches.len() < 2 {
        return Ok(graph);
    }

    for from in branches {
        for to in branches.iter().filter(|b| b.branch != from.branch) {
            let api = api.clone();
            let (from_ctx, to_branch) = (from.context.clone(), to.clone());
            graph.add_node(
                GraphNode::new(
                    link_id(&from.branch, &to.branch),
                    Operation::new(move || install_remote_secret(api, from_ctx, to_branch)),
                )
                .branch(from.branch.as_str()),
            )?;
        }
    }
    Ok(graph)
}

/// Links recorded in a trust graph report
pub fn links_from_report(branches: &[ReadyBranch], nodes: &[NodeReport]) -> Vec<TrustLink> {
    let mut links = Vec::new();
    for from in branches {
        for to in branches.iter().filter(|b| b.branch != from.branch) {
            let id = link_id(&from.branch, &to.branch);
            if let Some(node) = nodes.iter().find(|n| n.id == id) {
                links.push(TrustLink {
                    from: from.branch.clone(),
                    to: to.branch.clone(),
                    state: node.state,
                    error: node.message.clone(),
                });
            }
        }
    }
    links
}

async fn install_remote_secret(
    api: Arc<dyn ClusterApi>,
    local: Arc<ClientContext>,
    peer: ReadyBranch,
) -> Result<()> {
    let token = api
        .issue_token(&peer.context, MESH_NAMESPACE, READER_SERVICE_ACCOUNT, REMOTE_TOKEN_TTL)
        .await?;
    let kubeconfig = peer.context.with_token(token).to_kubeconfig_yaml()?;
    api.apply_remote_secret(&local, MESH_NAMESPACE, &peer.cluster_name, &kubeconfig)
        .await?;
    info!(
        local = %local.name(),
        peer = %peer.cluster_name,
        "Remote secret installed"
    );
    Ok(())
}
