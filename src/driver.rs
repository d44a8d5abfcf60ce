//! Execution driver
//!
//! One resource graph per cloud target, all sharing a single mesh identity.
//! Every graph is planned and validated before any node runs; the graphs then
//! run concurrently and never abort one another. Branches that finish get
//! remote secrets for each other in a final trust graph.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterSpec;
use crate::cluster_api::ClusterApi;
use crate::config::RunConfig;
use crate::credentials::CredentialBroker;
use crate::graph::{GraphNode, Operation, ResourceGraph};
use crate::install::PackageInstaller;
use crate::mesh::trust::{build_trust_graph, links_from_report, ReadyBranch, TrustLink};
use crate::mesh::{BranchNodes, BranchState, MeshBootstrapper, MeshSettings};
use crate::provider::{BackendAdapter, BackendRegistry};
use crate::readiness::ReadinessVerifier;
use crate::result::{BranchResult, RunResult, RunStatus};
use crate::Result;

/// A branch planned but not yet run
struct BranchPlan {
    spec: ClusterSpec,
    network: String,
    state: Arc<BranchState>,
    ids: BranchNodes,
}

/// Runs a multi-cloud mesh bootstrap end to end
pub struct ExecutionDriver {
    backends: BackendRegistry,
    installer: Arc<dyn PackageInstaller>,
    api: Arc<dyn ClusterApi>,
}

impl ExecutionDriver {
    /// Create a driver over the given collaborators
    pub fn new(
        backends: BackendRegistry,
        installer: Arc<dyn PackageInstaller>,
        api: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            backends,
            installer,
            api,
        }
    }

    /// Bootstrap every cloud target in `config`.
    ///
    /// Validation errors (config, unknown cloud, graph shape) abort before
    /// anything runs. Failures during execution are reported per branch in
    /// the returned [`RunResult`]. Every run resolves client contexts through
    /// its own broker, scrubbed when the run ends either way.
    #[instrument(skip_all, fields(mesh_id = %config.mesh_id))]
    pub async fn bootstrap(&self, config: &RunConfig, cancel: CancellationToken) -> Result<RunResult> {
        self.bootstrap_with(config, cancel, Arc::new(CredentialBroker::new()))
            .await
    }

    async fn bootstrap_with(
        &self,
        config: &RunConfig,
        cancel: CancellationToken,
        broker: Arc<CredentialBroker>,
    ) -> Result<RunResult> {
        let result = self.run(config, cancel, &broker).await;
        let released = broker.scrub();
        debug!(released, "Scrubbed client contexts");
        result
    }

    async fn run(
        &self,
        config: &RunConfig,
        cancel: CancellationToken,
        broker: &Arc<CredentialBroker>,
    ) -> Result<RunResult> {
        config.validate()?;
        let identity = Arc::new(config.mesh_identity()?);
        let verifier =
            ReadinessVerifier::new(self.api.clone()).with_poll_interval(config.poll_interval());
        let bootstrapper = MeshBootstrapper::new(
            self.installer.clone(),
            self.api.clone(),
            verifier,
            identity.clone(),
            MeshSettings {
                charts: config.charts.clone(),
                install_timeout: config.install_timeout(),
                verification_timeout: config.verification_timeout(),
                best_effort_proxy_check: config.best_effort_proxy_check,
            },
        );

        let mut planned = Vec::with_capacity(config.cloud_targets.len());
        for spec in &config.cloud_targets {
            let adapter = self.backends.get(&spec.cloud)?;
            planned.push(self.plan_branch(&bootstrapper, adapter, broker.clone(), spec)?);
        }
        info!(
            branches = planned.len(),
            parallelism = config.parallelism,
            "Starting bootstrap"
        );

        let runs = planned.into_iter().map(|(plan, graph)| {
            let cancel = cancel.clone();
            async move { (plan, graph.run(config.parallelism, cancel).await) }
        });
        let finished = join_all(runs).await;

        let mut cancelled = false;
        let mut branches = BTreeMap::new();
        let mut ready = Vec::new();
        for (plan, report) in finished {
            let report = report?;
            cancelled |= report.cancelled;
            let result = BranchResult::from_report(
                &plan.spec,
                &plan.network,
                &plan.state,
                &plan.ids,
                &report,
            );
            log_branch(&result);
            if result.status == RunStatus::Succeeded {
                if let Some(context) = plan.state.context() {
                    ready.push(ReadyBranch {
                        branch: plan.spec.cloud.clone(),
                        cluster_name: plan.spec.name.clone(),
                        context,
                    });
                }
            }
            branches.insert(plan.spec.cloud.clone(), result);
        }

        let mut trust_links = Vec::new();
        if config.exchange_remote_secrets && !cancelled {
            let (links, trust_cancelled) = self.exchange_trust(&ready, config, &cancel).await?;
            trust_links = links;
            cancelled |= trust_cancelled;
        }

        let result = RunResult::new(identity.mesh_id(), branches, trust_links, cancelled);
        info!(
            status = ?result.status,
            succeeded = result.branches.values().filter(|b| b.status == RunStatus::Succeeded).count(),
            total = result.branches.len(),
            "Bootstrap finished"
        );
        Ok(result)
    }

    /// Cluster node plus the mesh chain, validated
    fn plan_branch(
        &self,
        bootstrapper: &MeshBootstrapper,
        adapter: Arc<dyn BackendAdapter>,
        broker: Arc<CredentialBroker>,
        spec: &ClusterSpec,
    ) -> Result<(BranchPlan, ResourceGraph)> {
        let ids = BranchNodes::for_branch(&spec.cloud);
        let state = Arc::new(BranchState::new());
        let mut graph = ResourceGraph::new(spec.cloud.as_str());

        let (cluster, cell) = (spec.clone(), state.clone());
        graph.add_node(
            GraphNode::new(
                &ids.cluster,
                Operation::new(move || provision(adapter, broker, cluster, cell)),
            )
            .branch(spec.cloud.as_str()),
        )?;
        bootstrapper.add_branch(&mut graph, &spec.cloud, &spec.name, state.clone(), &ids.cluster)?;

        let levels = graph.validate()?;
        debug!(
            cloud = %spec.cloud,
            nodes = graph.len(),
            levels = levels.len(),
            "Planned branch"
        );

        let network = bootstrapper.identity().network_for(&spec.cloud)?.to_string();
        Ok((
            BranchPlan {
                spec: spec.clone(),
                network,
                state,
                ids,
            },
            graph,
        ))
    }

    /// Remote secrets between every pair of ready branches
    async fn exchange_trust(
        &self,
        ready: &[ReadyBranch],
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<(Vec<TrustLink>, bool)> {
        if ready.len() < 2 {
            debug!(ready = ready.len(), "Fewer than two ready branches; no remote secrets");
            return Ok((Vec::new(), false));
        }

        let graph = build_trust_graph(self.api.clone(), ready)?;
        let report = graph.run(config.parallelism, cancel.clone()).await?;
        let links = links_from_report(ready, &report.nodes);
        for link in links.iter().filter(|l| l.error.is_some()) {
            warn!(
                from = %link.from,
                to = %link.to,
                error = link.error.as_deref().unwrap_or_default(),
                "Remote secret not installed"
            );
        }
        Ok((links, report.cancelled))
    }
}

#[instrument(skip_all, fields(cloud = %spec.cloud, cluster = %spec.name))]
async fn provision(
    adapter: Arc<dyn BackendAdapter>,
    broker: Arc<CredentialBroker>,
    spec: ClusterSpec,
    state: Arc<BranchState>,
) -> Result<()> {
    let handle = adapter.ensure_cluster(&spec).await?;
    let context = broker.resolve(&handle)?;
    info!(endpoint = %handle.endpoint, "Cluster ready");
    state.set_handle(handle)?;
    state.set_context(context)
}

fn log_branch(result: &BranchResult) {
    match &result.error {
        Some(error) => warn!(
            cloud = %result.cloud,
            cluster = %result.cluster_name,
            node = %error.node,
            kind = %error.kind,
            error = %error.message,
            "Branch failed"
        ),
        None => info!(
            cloud = %result.cloud,
            cluster = %result.cluster_name,
            status = ?result.status,
            "Branch finished"
        ),
    }
}
