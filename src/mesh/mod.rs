//! Multi-primary, multi-network service mesh
//!
//! Every cluster gets its own control plane (no external istiod) joined into a
//! single mesh by a shared mesh ID, with one network per cluster. Traffic
//! between networks crosses an east-west gateway on the mTLS port; control
//! planes discover each other's endpoints through remote secrets.
//!
//! - [`MeshIdentity`] is the read-only value shared by every branch
//! - [`MeshBootstrapper`] adds one cluster's install chain to a graph
//! - [`trust`] wires remote secrets between finished branches

mod bootstrap;
pub mod trust;
pub mod values;

pub use bootstrap::{BranchNodes, BranchState, MeshBootstrapper, MeshSettings};

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{Error, Result};

/// Namespace holding the control plane and gateway
pub const MESH_NAMESPACE: &str = "istio-system";

/// Namespace label carrying the cluster's network ID
pub const NETWORK_LABEL: &str = "topology.istio.io/network";

/// Label selecting control-plane pods
pub const CONTROL_PLANE_SELECTOR: (&str, &str) = ("app", "istiod");

/// Label selecting east-west gateway pods
pub const GATEWAY_SELECTOR: (&str, &str) = ("istio", "eastwestgateway");

/// Gateway status-check port
pub const STATUS_PORT: u16 = 15021;

/// Gateway cluster-to-cluster mTLS port
pub const MTLS_PORT: u16 = 15443;

/// Release names
pub const BASE_RELEASE: &str = "istio-base";
/// Control plane release
pub const CONTROL_PLANE_RELEASE: &str = "istiod";
/// East-west gateway release
pub const GATEWAY_RELEASE: &str = "istio-eastwestgateway";

/// Default trust domain
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Mesh-wide identity shared read-only by every branch
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshIdentity {
    mesh_id: String,
    trust_domain: String,
    networks: BTreeMap<String, String>,
}

impl MeshIdentity {
    /// Build the identity from a mesh ID, trust domain and branch → network
    /// ID mapping.
    ///
    /// Rejects an empty mesh ID or trust domain, and network IDs that are
    /// empty or shared by two branches.
    pub fn new(
        mesh_id: impl Into<String>,
        trust_domain: impl Into<String>,
        networks: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mesh_id = mesh_id.into();
        let trust_domain = trust_domain.into();

        if mesh_id.trim().is_empty() {
            return Err(Error::validation("mesh ID must not be empty"));
        }
        if trust_domain.trim().is_empty() {
            return Err(Error::validation("trust domain must not be empty"));
        }

        let mut seen = BTreeSet::new();
        for (branch, network) in &networks {
            if network.trim().is_empty() {
                return Err(Error::validation(format!(
                    "network ID for {} must not be empty",
                    branch
                )));
            }
            if !seen.insert(network.as_str()) {
                return Err(Error::validation(format!(
                    "network ID '{}' is used by more than one cluster",
                    network
                )));
            }
        }

        Ok(Self {
            mesh_id,
            trust_domain,
            networks,
        })
    }

    /// Mesh ID shared by every cluster
    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    /// SPIFFE trust domain
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Network ID of a branch
    pub fn network_for(&self, branch: &str) -> Result<&str> {
        self.networks
            .get(branch)
            .map(String::as_str)
            .ok_or_else(|| Error::validation(format!("no network ID for {}", branch)))
    }

    /// Branch → network ID mapping
    pub fn networks(&self) -> &BTreeMap<String, String> {
        &self.networks
    }
}
