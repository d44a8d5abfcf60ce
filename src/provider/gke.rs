//! GCP GKE backend
//!
//! Drives `gcloud container clusters`. Clients authenticate with a static
//! bearer token taken from `gcloud auth print-access-token` when the handle is
//! built; the token lives only as long as the run.
//!
//! `--num-nodes` counts nodes per zone, so regional clusters are pinned to a
//! single zone of their region and the requested node count is the total.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{classify_cli_error, report_drift, BackendAdapter};
use crate::cluster::{AuthDescriptor, ClusterHandle, ClusterSpec};
use crate::credentials::Secret;
use crate::error::BackendError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::poll::poll_until;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    name: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    master_auth: Option<GkeMasterAuth>,
    #[serde(default)]
    current_master_version: Option<String>,
    #[serde(default)]
    current_node_count: Option<u32>,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeMasterAuth {
    #[serde(default)]
    cluster_ca_certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GceRegion {
    #[serde(default)]
    zones: Vec<String>,
}

/// Zones end in a single letter, e.g. `us-west1-a`
fn is_zone(location: &str) -> bool {
    match location.rsplit_once('-') {
        Some((_, suffix)) => {
            suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_lowercase())
        }
        None => false,
    }
}

impl GkeCluster {
    /// RECONCILING clusters keep serving while an upgrade rolls through
    fn is_serving(&self) -> bool {
        self.status == "RUNNING" || self.status == "RECONCILING"
    }

    fn is_provisioning(&self) -> bool {
        self.status == "PROVISIONING"
    }
}

/// GCP GKE backend adapter
#[derive(Clone)]
pub struct GkeBackend {
    runner: Arc<dyn CommandRunner>,
    project: Option<String>,
    create_timeout: Duration,
    poll_interval: Duration,
}

impl GkeBackend {
    /// Create an adapter that runs `gcloud` through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, create_timeout: Duration) -> Self {
        Self {
            runner,
            project: None,
            create_timeout,
            poll_interval: Duration::from_secs(15),
        }
    }

    /// Pin every call to a GCP project
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Override the interval between status polls while a cluster is created
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn gcloud<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let cmd = CommandSpec::new("gcloud").args(args);
        match &self.project {
            Some(project) => cmd.args(["--project", project.as_str()]),
            None => cmd,
        }
    }

    async fn describe_raw(&self, spec: &ClusterSpec) -> Result<Option<GkeCluster>> {
        let cmd = self.gcloud([
            "container",
            "clusters",
            "describe",
            spec.name.as_str(),
            "--location",
            spec.region.as_str(),
            "--format",
            "json",
        ]);
        let output = self.runner.run(&cmd).await?;

        if !output.success {
            if output.stderr.contains("NOT_FOUND") || output.stderr.contains("was not found") {
                return Ok(None);
            }
            return Err(classify_cli_error(&output.stderr).into());
        }

        serde_json::from_str(&output.stdout).map(Some).map_err(|e| {
            Error::serialization(format!("failed to parse gke describe output: {}", e))
        })
    }

    async fn access_token(&self) -> Result<Secret> {
        let output = self
            .runner
            .run(&self.gcloud(["auth", "print-access-token"]))
            .await?;
        if !output.success {
            return Err(classify_cli_error(&output.stderr).into());
        }
        let token = output.stdout.trim();
        if token.is_empty() {
            return Err(BackendError::PermissionDenied(
                "gcloud returned an empty access token".into(),
            )
            .into());
        }
        Ok(Secret::new(token))
    }

    async fn to_handle(&self, cluster: GkeCluster) -> Result<ClusterHandle> {
        let endpoint = cluster.endpoint.filter(|e| !e.is_empty()).ok_or_else(|| {
            BackendError::Rejected(format!("cluster {} has no endpoint", cluster.name))
        })?;
        let ca_bundle = cluster
            .master_auth
            .and_then(|auth| auth.cluster_ca_certificate)
            .ok_or_else(|| {
                BackendError::Rejected(format!("cluster {} has no CA certificate", cluster.name))
            })?;

        Ok(ClusterHandle {
            cluster_name: cluster.name,
            endpoint: format!("https://{}", endpoint),
            ca_bundle,
            auth: AuthDescriptor::Token {
                token: self.access_token().await?,
            },
            kubernetes_version: cluster.current_master_version,
            node_count: cluster.current_node_count,
        })
    }

    /// Zone the node pool lives in: the location itself, or the first zone
    /// of a region
    async fn node_zone(&self, spec: &ClusterSpec) -> Result<String> {
        if is_zone(&spec.region) {
            return Ok(spec.region.clone());
        }

        let cmd = self.gcloud([
            "compute",
            "regions",
            "describe",
            spec.region.as_str(),
            "--format",
            "json",
        ]);
        let output = self.runner.run(&cmd).await?;
        if !output.success {
            return Err(classify_cli_error(&output.stderr).into());
        }

        let region: GceRegion = serde_json::from_str(&output.stdout).map_err(|e| {
            Error::serialization(format!("failed to parse compute region output: {}", e))
        })?;
        region
            .zones
            .iter()
            .filter_map(|url| url.rsplit('/').next())
            .filter(|zone| !zone.is_empty())
            .min()
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::InvalidRegion(format!("region {} has no zones", spec.region)).into()
            })
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<()> {
        let nodes = spec.node_count.to_string();
        let zone = self.node_zone(spec).await?;
        let cmd = self.gcloud([
            "container",
            "clusters",
            "create",
            spec.name.as_str(),
            "--location",
            spec.region.as_str(),
            "--node-locations",
            zone.as_str(),
            "--num-nodes",
            nodes.as_str(),
            "--machine-type",
            spec.machine_type.as_str(),
            "--cluster-version",
            spec.version(),
            "--quiet",
            "--format",
            "json",
        ]);

        info!(cluster = %spec.name, location = %spec.region, zone = %zone, "Creating GKE cluster");
        let output = self.runner.run(&cmd).await?;
        if !output.success {
            return Err(classify_cli_error(&output.stderr).into());
        }
        Ok(())
    }

    async fn wait_until_serving(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        let cluster = poll_until(
            &format!("GKE cluster {}", spec.name),
            self.create_timeout,
            self.poll_interval,
            || async move {
                self.describe_raw(spec).await.and_then(|cluster| match cluster {
                    Some(c) if c.is_serving() => Ok(Some(c)),
                    Some(c) if c.is_provisioning() => Ok(None),
                    Some(c) => Err(Error::from(BackendError::Rejected(format!(
                        "cluster {} is in state {}",
                        c.name, c.status
                    )))),
                    None => Ok(None),
                })
            },
        )
        .await?
        .ok_or_else(|| {
            Error::timeout(format!("create GKE cluster {}", spec.name), self.create_timeout)
        })?;

        self.to_handle(cluster).await
    }

    async fn ensure_inner(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        match self.describe_raw(spec).await? {
            Some(cluster) if cluster.is_serving() => {
                info!("GKE cluster already exists");
                let handle = self.to_handle(cluster).await?;
                report_drift(spec, &handle);
                Ok(handle)
            }
            Some(cluster) if cluster.is_provisioning() => {
                warn!("GKE cluster is still provisioning, waiting");
                self.wait_until_serving(spec).await
            }
            Some(cluster) => Err(BackendError::Rejected(format!(
                "cluster {} is in state {}",
                cluster.name, cluster.status
            ))
            .into()),
            None => {
                self.create(spec).await?;
                self.wait_until_serving(spec).await
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for GkeBackend {
    #[instrument(skip(self, spec), fields(cluster = %spec.name))]
    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        tokio::time::timeout(self.create_timeout, self.ensure_inner(spec))
            .await
            .map_err(|_| {
                Error::timeout(format!("create GKE cluster {}", spec.name), self.create_timeout)
            })?
    }

    async fn describe_cluster(&self, spec: &ClusterSpec) -> Result<Option<ClusterHandle>> {
        match self.describe_raw(spec).await? {
            Some(cluster) if cluster.is_serving() => Ok(Some(self.to_handle(cluster).await?)),
            _ => Ok(None),
        }
    }
}
