//! Resource graph
//!
//! A DAG of idempotent operations. Nodes run as soon as every dependency has
//! settled, up to a parallelism cap, so independent branches proceed
//! concurrently while each chain runs strictly in order.
//!
//! # Failure propagation
//!
//! One rule: a node is settled when it succeeded, or when it failed and is
//! [`Criticality::BestEffort`]. A failed required node marks every
//! not-yet-started descendant [`NodeState::Skipped`]; nodes outside its
//! subtree keep running.

mod sequence;

pub use sequence::Levels;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// How a node's failure affects the rest of the graph
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Criticality {
    /// Failure skips descendants and fails the graph
    #[default]
    Required,
    /// Failure is logged; descendants still run
    BestEffort,
}

/// Lifecycle of a node within one run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Waiting on dependencies
    Pending,
    /// Operation in flight
    Running,
    /// Operation completed
    Succeeded,
    /// Operation returned an error
    Failed,
    /// Never started: an ancestor failed or the run was cancelled
    Skipped,
}

impl NodeState {
    /// True once the node can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A unit of work run at most once
pub struct Operation(Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>);

impl Operation {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(f())))
    }

    fn start(self) -> BoxFuture<'static, Result<()>> {
        (self.0)()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Operation")
    }
}

/// A node to add to a [`ResourceGraph`]
#[derive(Debug)]
pub struct GraphNode {
    id: String,
    branch: Option<String>,
    criticality: Criticality,
    depends_on: Vec<String>,
    operation: Operation,
}

impl GraphNode {
    /// Required node with no dependencies
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            branch: None,
            criticality: Criticality::Required,
            depends_on: Vec::new(),
            operation,
        }
    }

    /// Attribute the node to a branch (one per cloud target)
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Add dependencies
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set the criticality
    pub fn criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of one node
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    /// Node id
    pub id: String,
    /// Branch the node belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Criticality tag
    pub criticality: Criticality,
    /// Final state
    pub state: NodeState,
    /// Error category, for failed nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    /// Error message for failed nodes, skip reason for skipped ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall time spent running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl NodeReport {
    /// True when this node failed or was skipped and is required
    pub fn is_fatal(&self) -> bool {
        self.criticality == Criticality::Required
            && matches!(self.state, NodeState::Failed | NodeState::Skipped)
    }
}

/// Outcome of a graph run
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphReport {
    /// Nodes in insertion order
    pub nodes: Vec<NodeReport>,
    /// The run was cancelled before every node started
    pub cancelled: bool,
}

impl GraphReport {
    /// True when every required node succeeded
    pub fn succeeded(&self) -> bool {
        !self.cancelled && !self.nodes.iter().any(NodeReport::is_fatal)
    }

    /// Report for a node id
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes belonging to `branch`
    pub fn branch<'a>(&'a self, branch: &'a str) -> impl Iterator<Item = &'a NodeReport> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.branch.as_deref() == Some(branch))
    }

    /// First required node that failed (in insertion order)
    pub fn first_failure(&self) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|n| n.state == NodeState::Failed && n.criticality == Criticality::Required)
    }
}

struct Slot {
    id: String,
    branch: Option<String>,
    criticality: Criticality,
    depends_on: Vec<String>,
    operation: Option<Operation>,
    state: NodeState,
    error_kind: Option<&'static str>,
    message: Option<String>,
    duration: Option<Duration>,
}

impl Slot {
    fn report(&self) -> NodeReport {
        NodeReport {
            id: self.id.clone(),
            branch: self.branch.clone(),
            criticality: self.criticality,
            state: self.state,
            error_kind: self.error_kind,
            message: self.message.clone(),
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
        }
    }
}

/// A DAG of operations (arena of nodes plus dependency edges)
#[derive(Default)]
pub struct ResourceGraph {
    name: String,
    slots: Vec<Slot>,
    index: BTreeMap<String, usize>,
}

impl fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGraph")
            .field("name", &self.name)
            .field("nodes", &self.slots.iter().map(|s| &s.id).collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceGraph {
    /// Create an empty graph; `name` only appears in logs
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Add a node. Dependencies may name nodes added later; they are checked
    /// by [`validate`](Self::validate).
    pub fn add_node(&mut self, node: GraphNode) -> Result<()> {
        if node.id.is_empty() {
            return Err(Error::validation("graph node id must not be empty"));
        }
        if self.index.contains_key(&node.id) {
            return Err(Error::validation(format!(
                "duplicate graph node id '{}'",
                node.id
            )));
        }
        if node.depends_on.contains(&node.id) {
            return Err(Error::CycleDetected(format!(
                "node '{}' depends on itself",
                node.id
            )));
        }

        self.index.insert(node.id.clone(), self.slots.len());
        self.slots.push(Slot {
            id: node.id,
            branch: node.branch,
            criticality: node.criticality,
            depends_on: node.depends_on,
            operation: Some(node.operation),
            state: NodeState::Pending,
            error_kind: None,
            message: None,
            duration: None,
        });
        Ok(())
    }

    /// Check every dependency exists and the graph is acyclic
    pub fn validate(&self) -> Result<Levels> {
        for slot in &self.slots {
            if let Some(missing) = slot.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
                return Err(Error::validation(format!(
                    "node '{}' depends on unknown node '{}'",
                    slot.id, missing
                )));
            }
        }
        Levels::compute(
            self.slots
                .iter()
                .map(|s| (s.id.as_str(), s.depends_on.as_slice())),
        )
    }

    /// Execution order grouped into levels
    pub fn levels(&self) -> Result<Levels> {
        self.validate()
    }

    /// Run every node, at most `parallelism` at a time.
    ///
    /// Fails without running anything if validation fails. Once running, node
    /// errors are recorded in the report, never returned.
    pub async fn run(
        mut self,
        parallelism: usize,
        cancel: CancellationToken,
    ) -> Result<GraphReport> {
        let levels = self.validate()?;
        let parallelism = parallelism.max(1);
        info!(
            graph = %self.name,
            nodes = self.slots.len(),
            levels = levels.len(),
            parallelism,
            "Running resource graph"
        );

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.slots.len()];
        let mut unsettled: Vec<usize> = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            unsettled.push(slot.depends_on.len());
            for dep in &slot.depends_on {
                dependents[self.index[dep]].push(i);
            }
        }

        let mut ready: VecDeque<usize> =
            (0..self.slots.len()).filter(|&i| unsettled[i] == 0).collect();
        let mut running: JoinSet<(usize, Result<()>, Duration)> = JoinSet::new();
        let mut tasks: BTreeMap<tokio::task::Id, usize> = BTreeMap::new();
        let mut cancelled = cancel.is_cancelled();

        loop {
            while !cancelled && running.len() < parallelism {
                let Some(i) = ready.pop_front() else { break };
                let slot = &mut self.slots[i];
                let Some(operation) = slot.operation.take() else {
                    continue;
                };
                slot.state = NodeState::Running;
                debug!(graph = %self.name, node = %slot.id, "Starting node");
                let handle = running.spawn(async move {
                    let started = Instant::now();
                    let result = operation.start().await;
                    (i, result, started.elapsed())
                });
                tasks.insert(handle.id(), i);
            }

            if running.is_empty() {
                break;
            }

            let joined = if cancelled {
                running.join_next_with_id().await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(
                            graph = %self.name,
                            in_flight = running.len(),
                            "Run cancelled, waiting for in-flight nodes"
                        );
                        cancelled = true;
                        continue;
                    }
                    joined = running.join_next_with_id() => joined,
                }
            };

            let (i, result, elapsed) = match joined {
                Some(Ok((_, outcome))) => outcome,
                Some(Err(join_error)) => {
                    if join_error.is_panic() {
                        std::panic::resume_unwind(join_error.into_panic());
                    }
                    let Some(i) = tasks.get(&join_error.id()).copied() else {
                        continue;
                    };
                    (i, Err(Error::Cancelled), Duration::ZERO)
                }
                None => break,
            };

            self.settle(i, result, elapsed, &dependents, &mut unsettled, &mut ready);
        }

        let mut unstarted = 0;
        for slot in self.slots.iter_mut().filter(|s| s.state == NodeState::Pending) {
            slot.state = NodeState::Skipped;
            if slot.message.is_none() {
                slot.message = Some("run cancelled".to_string());
            }
            unstarted += 1;
        }
        // a cancel that arrives after the last node started changes nothing
        let cancelled = cancelled && unstarted > 0;

        let report = GraphReport {
            nodes: self.slots.iter().map(Slot::report).collect(),
            cancelled,
        };
        info!(
            graph = %self.name,
            succeeded = report.succeeded(),
            cancelled,
            "Resource graph finished"
        );
        Ok(report)
    }

    fn settle(
        &mut self,
        i: usize,
        result: Result<()>,
        elapsed: Duration,
        dependents: &[Vec<usize>],
        unsettled: &mut [usize],
        ready: &mut VecDeque<usize>,
    ) {
        let slot = &mut self.slots[i];
        slot.duration = Some(elapsed);

        let release = match result {
            Ok(()) => {
                slot.state = NodeState::Succeeded;
                info!(
                    graph = %self.name,
                    node = %slot.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Node succeeded"
                );
                true
            }
            Err(e) => {
                slot.state = NodeState::Failed;
                slot.error_kind = Some(e.kind());
                slot.message = Some(e.to_string());
                match slot.criticality {
                    Criticality::BestEffort => {
                        warn!(
                            graph = %self.name,
                            node = %slot.id,
                            error = %e,
                            "Best-effort node failed, continuing"
                        );
                        true
                    }
                    Criticality::Required => {
                        error!(graph = %self.name, node = %slot.id, error = %e, "Node failed");
                        false
                    }
                }
            }
        };

        if release {
            for &d in &dependents[i] {
                unsettled[d] -= 1;
                if unsettled[d] == 0 && self.slots[d].state == NodeState::Pending {
                    ready.push_back(d);
                }
            }
        } else {
            self.skip_descendants(i, dependents);
        }
    }

    fn skip_descendants(&mut self, failed: usize, dependents: &[Vec<usize>]) {
        let reason = format!("dependency '{}' failed", self.slots[failed].id);
        let mut queue: VecDeque<usize> = dependents[failed].iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            let slot = &mut self.slots[d];
            if slot.state != NodeState::Pending {
                continue;
            }
            slot.state = NodeState::Skipped;
            slot.message = Some(reason.clone());
            debug!(graph = %self.name, node = %slot.id, reason = %reason, "Node skipped");
            queue.extend(dependents[d].iter().copied());
        }
    }
}
