//! AWS EKS backend
//!
//! Creates clusters with `eksctl` (which owns the VPC and node group plumbing)
//! and reads them back with `aws eks describe-cluster`. Clients authenticate
//! with a short-lived token minted by `aws eks get-token` on every request.
//! Node counts come from the desired size of the cluster's node group.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{classify_cli_error, report_drift, BackendAdapter};
use crate::cluster::{AuthDescriptor, ClusterHandle, ClusterSpec};
use crate::error::BackendError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::poll::poll_until;
use crate::{Error, Result};

/// Node group created alongside every cluster
const NODE_GROUP_NAME: &str = "workers";

#[derive(Debug, Deserialize)]
struct DescribeClusterOutput {
    cluster: EksCluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EksCluster {
    name: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    certificate_authority: Option<EksCertificateAuthority>,
    #[serde(default)]
    version: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct EksCertificateAuthority {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DescribeNodegroupOutput {
    nodegroup: EksNodegroup,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EksNodegroup {
    #[serde(default)]
    scaling_config: Option<EksScalingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EksScalingConfig {
    #[serde(default)]
    desired_size: Option<u32>,
}

/// AWS EKS backend adapter
#[derive(Clone)]
pub struct EksBackend {
    runner: Arc<dyn CommandRunner>,
    profile: Option<String>,
    create_timeout: Duration,
    poll_interval: Duration,
}

impl EksBackend {
    /// Create an adapter that runs the AWS tooling through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, create_timeout: Duration) -> Self {
        Self {
            runner,
            profile: None,
            create_timeout,
            poll_interval: Duration::from_secs(15),
        }
    }

    /// Use a named AWS CLI profile for every call, including token minting
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Override the interval between status polls while a cluster is created
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn aws(&self, spec: &ClusterSpec) -> CommandSpec {
        let cmd = CommandSpec::new("aws").args(["--region", spec.region.as_str()]);
        match &self.profile {
            Some(profile) => cmd.env("AWS_PROFILE", profile),
            None => cmd,
        }
    }

    async fn describe_raw(&self, spec: &ClusterSpec) -> Result<Option<EksCluster>> {
        let cmd = self.aws(spec).args([
            "eks",
            "describe-cluster",
            "--name",
            spec.name.as_str(),
            "--output",
            "json",
        ]);
        let output = self.runner.run(&cmd).await?;

        if !output.success {
            if output.stderr.contains("ResourceNotFoundException") {
                return Ok(None);
            }
            return Err(classify_cli_error(&output.stderr).into());
        }

        let parsed: DescribeClusterOutput = serde_json::from_str(&output.stdout).map_err(|e| {
            Error::serialization(format!("failed to parse eks describe-cluster output: {}", e))
        })?;
        Ok(Some(parsed.cluster))
    }

    /// Desired size of the node group, `None` when the group does not exist
    async fn describe_node_group(&self, spec: &ClusterSpec) -> Result<Option<u32>> {
        let cmd = self.aws(spec).args([
            "eks",
            "describe-nodegroup",
            "--cluster-name",
            spec.name.as_str(),
            "--nodegroup-name",
            NODE_GROUP_NAME,
            "--output",
            "json",
        ]);
        let output = self.runner.run(&cmd).await?;

        if !output.success {
            if output.stderr.contains("ResourceNotFoundException") {
                return Ok(None);
            }
            return Err(classify_cli_error(&output.stderr).into());
        }

        let parsed: DescribeNodegroupOutput = serde_json::from_str(&output.stdout).map_err(|e| {
            Error::serialization(format!("failed to parse eks describe-nodegroup output: {}", e))
        })?;
        Ok(parsed.nodegroup.scaling_config.and_then(|c| c.desired_size))
    }

    /// Handle for an active cluster, with its node count when it can be read
    async fn resolve_handle(&self, spec: &ClusterSpec, cluster: EksCluster) -> Result<ClusterHandle> {
        let node_count = match self.describe_node_group(spec).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Could not read node group size");
                None
            }
        };
        self.to_handle(spec, cluster, node_count)
    }

    fn to_handle(
        &self,
        spec: &ClusterSpec,
        cluster: EksCluster,
        node_count: Option<u32>,
    ) -> Result<ClusterHandle> {
        let endpoint = cluster.endpoint.filter(|e| !e.is_empty()).ok_or_else(|| {
            BackendError::Rejected(format!("cluster {} has no endpoint", cluster.name))
        })?;
        let ca_bundle = cluster
            .certificate_authority
            .and_then(|ca| ca.data)
            .ok_or_else(|| {
                BackendError::Rejected(format!("cluster {} has no CA data", cluster.name))
            })?;

        let mut env = BTreeMap::new();
        if let Some(profile) = &self.profile {
            env.insert("AWS_PROFILE".to_string(), profile.clone());
        }

        Ok(ClusterHandle {
            auth: AuthDescriptor::Exec {
                command: "aws".to_string(),
                args: vec![
                    "--region".to_string(),
                    spec.region.clone(),
                    "eks".to_string(),
                    "get-token".to_string(),
                    "--cluster-name".to_string(),
                    cluster.name.clone(),
                    "--output".to_string(),
                    "json".to_string(),
                ],
                env,
            },
            cluster_name: cluster.name,
            endpoint,
            ca_bundle,
            kubernetes_version: cluster.version,
            node_count,
        })
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<()> {
        let nodes = spec.node_count.to_string();
        let mut cmd = CommandSpec::new("eksctl").args([
            "create",
            "cluster",
            "--name",
            spec.name.as_str(),
            "--region",
            spec.region.as_str(),
            "--version",
            spec.version(),
            "--nodegroup-name",
            NODE_GROUP_NAME,
            "--node-type",
            spec.machine_type.as_str(),
            "--nodes",
            nodes.as_str(),
            "--managed",
        ]);
        if let Some(profile) = &self.profile {
            cmd = cmd.args(["--profile", profile.as_str()]);
        }

        info!(cluster = %spec.name, region = %spec.region, "Creating EKS cluster");
        let output = self.runner.run(&cmd).await?;
        if !output.success {
            return Err(classify_cli_error(&output.stderr).into());
        }
        Ok(())
    }

    async fn wait_until_active(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        let cluster = poll_until(
            &format!("EKS cluster {}", spec.name),
            self.create_timeout,
            self.poll_interval,
            || async move {
                self.describe_raw(spec).await.and_then(|cluster| match cluster {
                    Some(c) if c.status == "ACTIVE" => Ok(Some(c)),
                    Some(c) if c.status == "CREATING" || c.status == "UPDATING" => Ok(None),
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
            Error::timeout(format!("create EKS cluster {}", spec.name), self.create_timeout)
        })?;

        self.resolve_handle(spec, cluster).await
    }

    async fn ensure_inner(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        match self.describe_raw(spec).await? {
            Some(cluster) if cluster.status == "ACTIVE" => {
                info!("EKS cluster already exists");
                let handle = self.resolve_handle(spec, cluster).await?;
                report_drift(spec, &handle);
                Ok(handle)
            }
            Some(cluster) => {
                warn!(status = %cluster.status, "EKS cluster exists but is not active, waiting");
                self.wait_until_active(spec).await
            }
            None => {
                self.create(spec).await?;
                self.wait_until_active(spec).await
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for EksBackend {
    #[instrument(skip(self, spec), fields(cluster = %spec.name))]
    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterHandle> {
        tokio::time::timeout(self.create_timeout, self.ensure_inner(spec))
            .await
            .map_err(|_| {
                Error::timeout(format!("create EKS cluster {}", spec.name), self.create_timeout)
            })?
    }

    async fn describe_cluster(&self, spec: &ClusterSpec) -> Result<Option<ClusterHandle>> {
        match self.describe_raw(spec).await? {
            Some(cluster) if cluster.status == "ACTIVE" => {
                Ok(Some(self.resolve_handle(spec, cluster).await?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec() -> ClusterSpec {
        ClusterSpec {
            name: "mesh-east".to_string(),
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            node_count: 2,
            machine_type: "t3.large".to_string(),
            kubernetes_version: "1.31".to_string(),
        }
    }

    fn describe_json(status: &str) -> String {
        serde_json::json!({
            "cluster": {
                "name": "mesh-east",
                "endpoint": "https://ABC.gr7.us-east-1.eks.amazonaws.com",
                "certificateAuthority": { "data": "Q0E=" },
                "version": "1.31",
                "status": status
            }
        })
        .to_string()
    }

    fn nodegroup_json(desired: u32) -> String {
        serde_json::json!({
            "nodegroup": {
                "nodegroupName": "workers",
                "scalingConfig": { "minSize": 1, "maxSize": 10, "desiredSize": desired }
            }
        })
        .to_string()
    }

    fn is_describe(cmd: &CommandSpec) -> bool {
        cmd.program == "aws" && cmd.has_arg("describe-cluster")
    }

    fn is_nodegroup(cmd: &CommandSpec) -> bool {
        cmd.program == "aws" && cmd.has_arg("describe-nodegroup") && cmd.has_arg("workers")
    }

    fn is_create(cmd: &CommandSpec) -> bool {
        cmd.program == "eksctl" && cmd.has_arg("create")
    }

    #[tokio::test]
    async fn test_ensure_returns_existing_cluster_without_creating() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .times(2)
            .returning(|_| Ok(CommandOutput::ok(describe_json("ACTIVE"))));
        runner
            .expect_run()
            .withf(|cmd| is_nodegroup(cmd))
            .times(2)
            .returning(|_| Ok(CommandOutput::ok(nodegroup_json(2))));
        runner.expect_run().withf(|cmd| is_create(cmd)).never();

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(60));
        let first = backend.ensure_cluster(&spec()).await.unwrap();
        let second = backend.ensure_cluster(&spec()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.node_count, Some(2));
        assert!(first.drift(&spec()).is_empty());
        assert_eq!(first.endpoint, "https://ABC.gr7.us-east-1.eks.amazonaws.com");
        match &first.auth {
            AuthDescriptor::Exec { command, args, .. } => {
                assert_eq!(command, "aws");
                assert!(args.contains(&"get-token".to_string()));
                assert!(args.contains(&"mesh-east".to_string()));
            }
            other => panic!("expected exec auth, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_creates_then_waits_for_active() {
        let describes = Arc::new(AtomicU32::new(0));
        let d = describes.clone();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .returning(move |_| {
                Ok(match d.fetch_add(1, Ordering::SeqCst) {
                    0 => CommandOutput::failed(
                        "An error occurred (ResourceNotFoundException) when calling the DescribeCluster operation: No cluster found for name: mesh-east.",
                    ),
                    1 => CommandOutput::ok(describe_json("CREATING")),
                    _ => CommandOutput::ok(describe_json("ACTIVE")),
                })
            });
        runner
            .expect_run()
            .withf(|cmd| {
                is_create(cmd)
                    && cmd.has_arg("t3.large")
                    && cmd.has_arg("1.31")
                    && cmd.has_arg("--managed")
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .withf(|cmd| is_nodegroup(cmd))
            .times(1)
            .returning(|_| Ok(CommandOutput::ok(nodegroup_json(2))));

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(600))
            .with_poll_interval(Duration::from_secs(10));
        let handle = backend.ensure_cluster(&spec()).await.unwrap();

        assert_eq!(handle.cluster_name, "mesh-east");
        assert_eq!(handle.node_count, Some(2));
        assert_eq!(describes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_existing_cluster_reports_node_group_drift() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .returning(|_| Ok(CommandOutput::ok(describe_json("ACTIVE"))));
        runner
            .expect_run()
            .withf(|cmd| is_nodegroup(cmd))
            .returning(|_| Ok(CommandOutput::ok(nodegroup_json(3))));
        runner.expect_run().withf(|cmd| is_create(cmd)).never();

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(60));
        let handle = backend.ensure_cluster(&spec()).await.unwrap();

        assert_eq!(handle.node_count, Some(3));
        let drift = handle.drift(&spec());
        assert_eq!(drift.len(), 1);
        assert!(drift[0].contains("node count is 3"));
    }

    #[tokio::test]
    async fn test_missing_node_group_leaves_count_unknown() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .returning(|_| Ok(CommandOutput::ok(describe_json("ACTIVE"))));
        runner.expect_run().withf(|cmd| is_nodegroup(cmd)).returning(|_| {
            Ok(CommandOutput::failed(
                "An error occurred (ResourceNotFoundException) when calling the DescribeNodegroup operation: No node group found for name: workers.",
            ))
        });

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(60));
        let handle = backend.describe_cluster(&spec()).await.unwrap().unwrap();
        assert_eq!(handle.node_count, None);
    }

    #[tokio::test]
    async fn test_ensure_maps_quota_rejection() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .returning(|_| Ok(CommandOutput::failed("ResourceNotFoundException")));
        runner.expect_run().withf(|cmd| is_create(cmd)).returning(|_| {
            Ok(CommandOutput::failed(
                "Error: creating CloudFormation stack: LimitExceededException: Cannot exceed quota for VPCs",
            ))
        });

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(60));
        let err = backend.ensure_cluster(&spec()).await.unwrap_err();
        assert!(matches!(err, Error::Backend(BackendError::QuotaExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_times_out_while_creating() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| is_describe(cmd))
            .returning(|_| Ok(CommandOutput::ok(describe_json("CREATING"))));

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(30))
            .with_poll_interval(Duration::from_secs(10));
        let err = backend.ensure_cluster(&spec()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_describe_failed_cluster_is_none() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::ok(describe_json("FAILED"))));

        let backend = EksBackend::new(Arc::new(runner), Duration::from_secs(60));
        assert!(backend.describe_cluster(&spec()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_profile_is_threaded_into_token_command() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.env.get("AWS_PROFILE").map(String::as_str) == Some("mesh"))
            .returning(|cmd| {
                Ok(CommandOutput::ok(if is_nodegroup(cmd) {
                    nodegroup_json(2)
                } else {
                    describe_json("ACTIVE")
                }))
            });

        let backend =
            EksBackend::new(Arc::new(runner), Duration::from_secs(60)).with_profile("mesh");
        let handle = backend.describe_cluster(&spec()).await.unwrap().unwrap();
        match handle.auth {
            AuthDescriptor::Exec { env, .. } => assert_eq!(env["AWS_PROFILE"], "mesh"),
            other => panic!("expected exec auth, got {other:?}"),
        }
    }
}
