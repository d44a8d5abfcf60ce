//! Package installer
//!
//! Installs or upgrades a named release of a chart into a cluster. The real
//! implementation drives `helm upgrade --install` against a kubeconfig
//! rendered from the branch's [`ClientContext`], so exec-token and static
//! credentials both work without Helm knowing the difference.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::credentials::ClientContext;
use crate::exec::{CommandRunner, CommandSpec};
use crate::{Error, Result};

/// Extra time given to the helm process beyond its own `--timeout`
const HELM_PROCESS_GRACE: Duration = Duration::from_secs(30);

/// Where a chart comes from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart name (with `repo`) or a local path / OCI reference (without)
    pub chart: String,
    /// Chart repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Chart version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ChartRef {
    /// Chart from a repository at a pinned version
    pub fn from_repo(
        repo: impl Into<String>,
        chart: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        Self {
            chart: chart.into(),
            repo: Some(repo.into()),
            version,
        }
    }
}

/// One release to install or upgrade
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRequest {
    /// Release name
    pub release: String,
    /// Bundle to install
    pub chart: ChartRef,
    /// Target namespace
    pub namespace: String,
    /// Chart values
    pub values: serde_json::Value,
    /// Bound on the whole install, including waiting for resources
    pub timeout: Duration,
}

/// Installs releases into a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Install the release, or upgrade it in place if it already exists
    async fn install_or_upgrade(&self, context: &ClientContext, request: &ReleaseRequest)
        -> Result<()>;
}

/// [`PackageInstaller`] backed by the helm CLI
#[derive(Clone)]
pub struct HelmInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl HelmInstaller {
    /// Create an installer that runs helm through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn command(request: &ReleaseRequest, kubeconfig: &str, values: &str) -> CommandSpec {
        let timeout = format!("{}s", request.timeout.as_secs().max(1));
        let mut cmd = CommandSpec::new("helm").args([
            "upgrade",
            "--install",
            request.release.as_str(),
            request.chart.chart.as_str(),
            "--namespace",
            request.namespace.as_str(),
            "--kubeconfig",
            kubeconfig,
            "--values",
            values,
            "--wait",
            "--timeout",
            timeout.as_str(),
        ]);
        if let Some(repo) = &request.chart.repo {
            cmd = cmd.args(["--repo", repo.as_str()]);
        }
        if let Some(version) = &request.chart.version {
            cmd = cmd.args(["--version", version.as_str()]);
        }
        cmd
    }
}

#[async_trait]
impl PackageInstaller for HelmInstaller {
    #[instrument(skip_all, fields(cluster = %context.name(), release = %request.release))]
    async fn install_or_upgrade(
        &self,
        context: &ClientContext,
        request: &ReleaseRequest,
    ) -> Result<()> {
        let kubeconfig = write_temp(context.to_kubeconfig_yaml()?.as_bytes())?;
        let values_json = serde_json::to_vec(&request.values)
            .map_err(|e| Error::serialization(format!("failed to encode values: {}", e)))?;
        let values = write_temp(&values_json)?;

        let cmd = Self::command(
            request,
            &kubeconfig.path().to_string_lossy(),
            &values.path().to_string_lossy(),
        );
        info!(chart = %request.chart.chart, namespace = %request.namespace, "Installing release");
        debug!(command = %cmd.display(), "Running helm");

        let operation = format!("install release {}", request.release);
        let output =
            tokio::time::timeout(request.timeout + HELM_PROCESS_GRACE, self.runner.run(&cmd))
                .await
                .map_err(|_| Error::timeout(operation.clone(), request.timeout))??;

        if output.success {
            info!("Release installed");
            return Ok(());
        }

        let stderr = output.stderr.trim();
        if stderr.contains("timed out waiting for the condition")
            || stderr.contains("context deadline exceeded")
        {
            return Err(Error::timeout(operation, request.timeout));
        }
        Err(Error::install(&request.release, stderr))
    }
}

fn write_temp(contents: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|e| Error::command("helm", format!("failed to create temp file: {}", e)))?;
    file.write_all(contents)
        .and_then(|_| file.flush())
        .map_err(|e| Error::command("helm", format!("failed to write temp file: {}", e)))?;
    Ok(file)
}
