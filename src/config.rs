//! Run configuration
//!
//! Loaded from YAML with camelCase keys. Everything except the cloud targets
//! and the mesh ID has a default.
//!
//! ```yaml
//! meshId: mesh1
//! cloudTargets:
//!   - name: mesh-east
//!     cloud: aws
//!     region: us-east-1
//!     nodeCount: 2
//!     machineType: t3.large
//!     kubernetesVersion: "1.31"
//!   - name: mesh-west
//!     cloud: gcp
//!     region: us-west1
//!     nodeCount: 2
//!     machineType: e2-standard-4
//!     kubernetesVersion: "1.31"
//! networkIds:
//!   gcp: west-network
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterSpec;
use crate::install::ChartRef;
use crate::mesh::{MeshIdentity, DEFAULT_TRUST_DOMAIN};
use crate::{Error, Result};

/// Placeholder replaced by the cloud identifier in the network template
pub const CLOUD_PLACEHOLDER: &str = "{cloud}";

/// Istio release chart repository
pub const DEFAULT_CHART_REPO: &str = "https://istio-release.storage.googleapis.com/charts";

/// Pinned mesh chart version
pub const DEFAULT_CHART_VERSION: &str = "1.24.2";

fn default_network_template() -> String {
    format!("{}-network", CLOUD_PLACEHOLDER)
}

fn default_trust_domain() -> String {
    DEFAULT_TRUST_DOMAIN.to_string()
}

fn default_verification_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_parallelism() -> usize {
    8
}

fn default_cluster_timeout_secs() -> u64 {
    1800
}

fn default_install_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// Everything a bootstrap run needs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// One cluster per cloud
    pub cloud_targets: Vec<ClusterSpec>,

    /// Mesh ID shared by every cluster
    pub mesh_id: String,

    /// Per-cloud network ID overrides
    #[serde(default)]
    pub network_ids: BTreeMap<String, String>,

    /// Network ID for clouds without an override
    #[serde(default = "default_network_template")]
    pub network_template: String,

    /// SPIFFE trust domain
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,

    /// Bound on each readiness check
    #[serde(default = "default_verification_timeout_secs")]
    pub verification_timeout_secs: u64,

    /// Gateway readiness failures are logged instead of failing the branch
    #[serde(default = "default_true")]
    pub best_effort_proxy_check: bool,

    /// Maximum number of concurrently running nodes per graph
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Bound on cluster creation
    #[serde(default = "default_cluster_timeout_secs")]
    pub cluster_timeout_secs: u64,

    /// Bound on each chart install
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// Interval between readiness checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Exchange remote secrets between finished clusters
    #[serde(default = "default_true")]
    pub exchange_remote_secrets: bool,

    /// Mesh chart references
    #[serde(default)]
    pub charts: ChartsConfig,
}

/// Where the mesh charts come from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartsConfig {
    /// Chart repository; `None` means chart names are paths or OCI refs
    #[serde(default)]
    pub repo: Option<String>,
    /// Version applied to every chart
    #[serde(default)]
    pub version: Option<String>,
    /// Base chart (CRDs)
    pub base: String,
    /// Control plane chart
    pub istiod: String,
    /// Gateway chart
    pub gateway: String,
}

impl Default for ChartsConfig {
    fn default() -> Self {
        Self {
            repo: Some(DEFAULT_CHART_REPO.to_string()),
            version: Some(DEFAULT_CHART_VERSION.to_string()),
            base: "base".to_string(),
            istiod: "istiod".to_string(),
            gateway: "gateway".to_string(),
        }
    }
}

impl ChartsConfig {
    fn chart(&self, name: &str) -> ChartRef {
        ChartRef {
            chart: name.to_string(),
            repo: self.repo.clone(),
            version: self.version.clone(),
        }
    }

    /// Base chart reference
    pub fn base_chart(&self) -> ChartRef {
        self.chart(&self.base)
    }

    /// Control plane chart reference
    pub fn control_plane_chart(&self) -> ChartRef {
        self.chart(&self.istiod)
    }

    /// Gateway chart reference
    pub fn gateway_chart(&self) -> ChartRef {
        self.chart(&self.gateway)
    }
}

impl RunConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::validation(format!("invalid run configuration: {}", e)))
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Check the configuration before anything runs
    pub fn validate(&self) -> Result<()> {
        if self.cloud_targets.is_empty() {
            return Err(Error::validation("cloudTargets must name at least one cluster"));
        }

        let mut clouds = BTreeSet::new();
        let mut names = BTreeSet::new();
        for spec in &self.cloud_targets {
            spec.validate()?;
            if !clouds.insert(spec.cloud.as_str()) {
                return Err(Error::validation(format!(
                    "cloud '{}' is targeted more than once",
                    spec.cloud
                )));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::validation(format!(
                    "cluster name '{}' is used more than once",
                    spec.name
                )));
            }
        }

        if let Some(cloud) = self.network_ids.keys().find(|c| !clouds.contains(c.as_str())) {
            return Err(Error::validation(format!(
                "networkIds names cloud '{}' which is not a target",
                cloud
            )));
        }
        if self.parallelism == 0 {
            return Err(Error::validation("parallelism must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::validation("pollIntervalSecs must be at least 1"));
        }
        if self.cluster_timeout_secs == 0 || self.install_timeout_secs == 0 {
            return Err(Error::validation(
                "clusterTimeoutSecs and installTimeoutSecs must be positive",
            ));
        }

        self.mesh_identity().map(|_| ())
    }

    /// Network ID for a cloud: the override if present, else the template
    pub fn network_id_for(&self, cloud: &str) -> String {
        self.network_ids
            .get(cloud)
            .cloned()
            .unwrap_or_else(|| self.network_template.replace(CLOUD_PLACEHOLDER, cloud))
    }

    /// Mesh identity for every target, keyed by cloud
    pub fn mesh_identity(&self) -> Result<MeshIdentity> {
        let networks = self
            .cloud_targets
            .iter()
            .map(|spec| (spec.cloud.clone(), self.network_id_for(&spec.cloud)))
            .collect();
        MeshIdentity::new(&self.mesh_id, &self.trust_domain, networks)
    }

    /// Bound on each readiness check
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    /// Bound on cluster creation
    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }

    /// Bound on each chart install
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Interval between readiness checks
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
