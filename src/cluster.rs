//! Cluster specs and handles
//!
//! A [`ClusterSpec`] is the immutable input for one cloud target. A
//! [`ClusterHandle`] is what a backend adapter hands back once the cluster
//! exists: where the API server lives, which CA signs it, and how to
//! authenticate against it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::credentials::Secret;
use crate::{Error, Result};

/// Desired shape of one managed cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name, unique within its cloud account and region
    pub name: String,
    /// Cloud identifier, used to pick the backend adapter and to key the branch
    pub cloud: String,
    /// Region or location
    pub region: String,
    /// Desired worker node count
    pub node_count: u32,
    /// Machine size for worker nodes (e.g. "t3.large", "e2-standard-4")
    pub machine_type: String,
    /// Kubernetes version (e.g. "1.31")
    pub kubernetes_version: String,
}

impl ClusterSpec {
    /// Validate the spec before any backend is contacted
    pub fn validate(&self) -> Result<()> {
        if !is_dns_label(&self.name) {
            return Err(Error::validation(format!(
                "cluster name '{}' must be a lowercase DNS label of at most 63 characters",
                self.name
            )));
        }
        if self.cloud.trim().is_empty() {
            return Err(Error::validation(format!(
                "cluster '{}' has no cloud identifier",
                self.name
            )));
        }
        if self.region.trim().is_empty() {
            return Err(Error::validation(format!(
                "cluster '{}' has no region",
                self.name
            )));
        }
        if self.node_count == 0 {
            return Err(Error::validation(format!(
                "cluster '{}' node count must be at least 1",
                self.name
            )));
        }
        if self.machine_type.trim().is_empty() {
            return Err(Error::validation(format!(
                "cluster '{}' has no machine type",
                self.name
            )));
        }
        if parse_minor_version(&self.kubernetes_version).is_none() {
            return Err(Error::validation(format!(
                "cluster '{}' has invalid kubernetes version '{}'",
                self.name, self.kubernetes_version
            )));
        }
        Ok(())
    }

    /// Kubernetes version without a leading `v`
    pub fn version(&self) -> &str {
        self.kubernetes_version.trim_start_matches('v')
    }
}

/// How a client authenticates against a cluster's API server
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthDescriptor {
    /// Short-lived token produced by running a command per request
    Exec {
        /// Program to run
        command: String,
        /// Program arguments
        args: Vec<String>,
        /// Extra environment for the program
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Static bearer token
    Token {
        /// The token
        token: Secret,
    },
    /// Static client certificate
    #[serde(rename_all = "camelCase")]
    ClientCertificate {
        /// Base64 encoded certificate PEM
        certificate: String,
        /// Base64 encoded private key PEM
        key: Secret,
    },
}

/// Connection details for a cluster that exists
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHandle {
    /// Cluster name as known by the backend
    pub cluster_name: String,
    /// API server URL
    pub endpoint: String,
    /// Base64 encoded CA bundle PEM
    pub ca_bundle: String,
    /// Authentication method
    pub auth: AuthDescriptor,
    /// Kubernetes version reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Node count reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

impl ClusterHandle {
    /// Differences between what the backend reports and what the spec asks for
    ///
    /// Versions are compared at minor granularity since backends pick the
    /// patch release themselves.
    pub fn drift(&self, spec: &ClusterSpec) -> Vec<String> {
        let mut drift = Vec::new();

        if let Some(actual) = &self.kubernetes_version {
            if parse_minor_version(actual) != parse_minor_version(&spec.kubernetes_version) {
                drift.push(format!(
                    "kubernetes version is {} but spec wants {}",
                    actual, spec.kubernetes_version
                ));
            }
        }

        if let Some(actual) = self.node_count {
            if actual != spec.node_count {
                drift.push(format!(
                    "node count is {} but spec wants {}",
                    actual, spec.node_count
                ));
            }
        }

        drift
    }
}

/// Authentication method of a handle, without its material
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    /// Exec plugin
    Exec,
    /// Static bearer token
    Token,
    /// Static client certificate
    ClientCertificate,
}

impl AuthDescriptor {
    /// Method only
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthDescriptor::Exec { .. } => AuthKind::Exec,
            AuthDescriptor::Token { .. } => AuthKind::Token,
            AuthDescriptor::ClientCertificate { .. } => AuthKind::ClientCertificate,
        }
    }
}

/// What a run reports about a cluster: a [`ClusterHandle`] minus every
/// credential, so results can outlive the run
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    /// Cluster name as known by the backend
    pub cluster_name: String,
    /// API server URL
    pub endpoint: String,
    /// Base64 encoded CA bundle PEM
    pub ca_bundle: String,
    /// Authentication method
    pub auth: AuthKind,
    /// Kubernetes version reported by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Node count reported by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

impl From<&ClusterHandle> for ClusterSummary {
    fn from(handle: &ClusterHandle) -> Self {
        Self {
            cluster_name: handle.cluster_name.clone(),
            endpoint: handle.endpoint.clone(),
            ca_bundle: handle.ca_bundle.clone(),
            auth: handle.auth.kind(),
            kubernetes_version: handle.kubernetes_version.clone(),
            node_count: handle.node_count,
        }
    }
}

/// Parse `MAJOR.MINOR[.PATCH][-suffix]` into (major, minor)
fn parse_minor_version(version: &str) -> Option<(u32, u32)> {
    let version = version.trim().trim_start_matches('v');
    let version = version.split(['-', '+']).next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    match parts.next() {
        None => {}
        Some(patch) => {
            patch.parse::<u32>().ok()?;
        }
    }
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor))
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
