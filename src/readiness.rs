//! Readiness verifier
//!
//! Bounded wait for a labeled workload to become Ready. A check that errors is
//! treated like a check that found nothing ready: clusters that were created
//! seconds ago routinely refuse the first few connections.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cluster_api::ClusterApi;
use crate::credentials::ClientContext;
use crate::poll::{poll_until, DEFAULT_POLL_INTERVAL};
use crate::{Error, Result};

/// Workloads to wait for: everything matching `labels` in `namespace`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkloadSelector {
    /// Namespace to look in
    pub namespace: String,
    /// Labels every matching workload carries
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSelector {
    /// Selector for a single `key=value` label
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            labels: BTreeMap::from([(key.into(), value.into())]),
        }
    }

    /// Label selector string (`a=b,c=d`)
    pub fn selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.selector())
    }
}

/// Outcome of a bounded wait
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Readiness {
    /// Every matching workload reported Ready
    Ready,
    /// The timeout elapsed first
    TimedOut,
}

impl Readiness {
    /// Convert a timed-out wait into an error
    pub fn into_result(self, selector: &WorkloadSelector, after: Duration) -> Result<()> {
        match self {
            Readiness::Ready => Ok(()),
            Readiness::TimedOut => Err(Error::VerificationTimeout {
                namespace: selector.namespace.clone(),
                selector: selector.selector(),
                after,
            }),
        }
    }
}

/// Polls a cluster until a workload is ready or a timeout elapses
#[derive(Clone)]
pub struct ReadinessVerifier {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl ReadinessVerifier {
    /// Create a verifier probing through `api`
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the interval between checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait until every workload matching `selector` is Ready.
    ///
    /// Always checks at least once. Never waits past `timeout`, even when a
    /// check hangs.
    pub async fn wait_for_condition(
        &self,
        context: &ClientContext,
        selector: &WorkloadSelector,
        timeout: Duration,
    ) -> Result<Readiness> {
        let label_selector = selector.selector();
        let ready = poll_until(
            &format!("workload {}", selector),
            timeout,
            self.poll_interval,
            || {
                let label_selector = label_selector.as_str();
                async move {
                    match self
                        .api
                        .label_selector_ready(context, &selector.namespace, label_selector)
                        .await
                    {
                        Ok(true) => Ok(Some(())),
                        Ok(false) => Ok(None),
                        Err(e) => {
                            warn!(
                                cluster = %context.name(),
                                selector = %selector,
                                error = %e,
                                "Readiness check failed, retrying"
                            );
                            Ok(None)
                        }
                    }
                }
            },
        )
        .await?;

        match ready {
            Some(()) => {
                info!(cluster = %context.name(), selector = %selector, "Workload ready");
                Ok(Readiness::Ready)
            }
            None => {
                warn!(
                    cluster = %context.name(),
                    selector = %selector,
                    timeout_secs = timeout.as_secs(),
                    "Workload not ready before timeout"
                );
                Ok(Readiness::TimedOut)
            }
        }
    }
}
