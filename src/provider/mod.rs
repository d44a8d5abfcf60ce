//! Cloud backend adapters
//!
//! Each cloud implements [`BackendAdapter`]: make sure a managed cluster
//! matching a [`ClusterSpec`] exists and hand back a [`ClusterHandle`]. The
//! adapter owns its cloud's auth plumbing and exposes it as an
//! [`AuthDescriptor`](crate::cluster::AuthDescriptor) the credential broker
//! understands.
//!
//! # Supported backends
//!
//! - [`EksBackend`] - AWS EKS via `eksctl` and the `aws` CLI, exec-token auth
//! - [`GkeBackend`] - GCP GKE via `gcloud`, static bearer token auth

mod eks;
mod gke;

pub use eks::EksBackend;
pub use gke::GkeBackend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::cluster::{ClusterHandle, ClusterSpec};
use crate::error::BackendError;
use crate::{Error, Result};

/// A cloud backend that can create and describe managed clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Make sure a cluster matching `spec` exists and is usable.
    ///
    /// Idempotent: an existing cluster is returned as-is without issuing a
    /// creation request. Version or size drift is logged, not corrected.
    async fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterHandle>;

    /// Look up the cluster named by `spec`.
    ///
    /// Returns `Ok(None)` when the cluster does not exist or is not yet
    /// serving.
    async fn describe_cluster(&self, spec: &ClusterSpec) -> Result<Option<ClusterHandle>>;
}

/// Backend adapters keyed by cloud identifier
#[derive(Clone, Default)]
pub struct BackendRegistry {
    adapters: BTreeMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for a cloud identifier, replacing any previous one
    pub fn register(mut self, cloud: impl Into<String>, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.insert(cloud.into(), adapter);
        self
    }

    /// Adapter for the given cloud
    pub fn get(&self, cloud: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters.get(cloud).cloned().ok_or_else(|| {
            Error::validation(format!(
                "no backend registered for cloud '{}' (known: {})",
                cloud,
                self.clouds().join(", ")
            ))
        })
    }

    /// Registered cloud identifiers
    pub fn clouds(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("clouds", &self.clouds())
            .finish()
    }
}

/// Log drift between an existing cluster and its spec
pub(crate) fn report_drift(spec: &ClusterSpec, handle: &ClusterHandle) {
    for drift in handle.drift(spec) {
        warn!(
            cloud = %spec.cloud,
            cluster = %spec.name,
            drift = %drift,
            "Existing cluster differs from spec; not correcting"
        );
    }
}

/// Map a cloud CLI's error output onto a backend failure mode
pub fn classify_cli_error(stderr: &str) -> BackendError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("quota")
        || lower.contains("limitexceeded")
        || lower.contains("resource_exhausted")
        || lower.contains("insufficientcapacity")
    {
        BackendError::QuotaExceeded(message)
    } else if lower.contains("accessdenied")
        || lower.contains("permission_denied")
        || lower.contains("permission denied")
        || lower.contains("unauthorizedoperation")
        || lower.contains("not authorized")
        || lower.contains("expiredtoken")
    {
        BackendError::PermissionDenied(message)
    } else if (lower.contains("region") || lower.contains("location") || lower.contains("zone"))
        && (lower.contains("invalid")
            || lower.contains("not valid")
            || lower.contains("unknown")
            || lower.contains("does not exist")
            || lower.contains("could not connect to the endpoint"))
    {
        BackendError::InvalidRegion(message)
    } else {
        BackendError::Rejected(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota() {
        let err = classify_cli_error(
            "An error occurred (ResourceLimitExceeded) when calling the CreateCluster operation",
        );
        assert!(matches!(err, BackendError::QuotaExceeded(_)));

        let err = classify_cli_error(
            "ERROR: (gcloud.container.clusters.create) ResponseError: code=403, message=Insufficient regional quota to satisfy request: resource \"CPUS\"",
        );
        assert!(matches!(err, BackendError::QuotaExceeded(_)));
    }

    #[test]
    fn test_classify_permission() {
        let err = classify_cli_error(
            "An error occurred (AccessDeniedException) when calling the DescribeCluster operation",
        );
        assert!(matches!(err, BackendError::PermissionDenied(_)));

        let err = classify_cli_error("ERROR: PERMISSION_DENIED: Required 'container.clusters.get'");
        assert!(matches!(err, BackendError::PermissionDenied(_)));
    }

    #[test]
    fn test_classify_region() {
        let err = classify_cli_error(
            "Could not connect to the endpoint URL: \"https://eks.mars-1.amazonaws.com/clusters\" (invalid region)",
        );
        assert!(matches!(err, BackendError::InvalidRegion(_)));

        let err = classify_cli_error("ERROR: Location \"europe-mars1\" is not valid.");
        assert!(matches!(err, BackendError::InvalidRegion(_)));
    }

    #[test]
    fn test_classify_fallback_keeps_message() {
        let err = classify_cli_error("  something odd happened \n");
        assert_eq!(err, BackendError::Rejected("something odd happened".to_string()));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut mock = MockBackendAdapter::new();
        mock.expect_describe_cluster().returning(|_| Ok(None));

        let registry = BackendRegistry::new().register("aws", Arc::new(mock));
        assert_eq!(registry.clouds(), vec!["aws".to_string()]);

        let adapter = registry.get("aws").unwrap();
        let spec = ClusterSpec {
            name: "a".into(),
            cloud: "aws".into(),
            region: "us-east-1".into(),
            node_count: 1,
            machine_type: "t3.large".into(),
            kubernetes_version: "1.31".into(),
        };
        assert!(adapter.describe_cluster(&spec).await.unwrap().is_none());

        let err = registry.get("azure").err().unwrap();
        assert!(err.is_validation());
        assert!(err.to_string().contains("azure"));
    }
}
