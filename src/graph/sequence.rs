//! Topological levels
//!
//! Groups the nodes of a resource graph so that every dependency of a node in
//! level N sits in levels 0..N-1. Nodes in the same level are independent of
//! each other and may run concurrently.

use std::collections::HashSet;

use tracing::debug;

use crate::{Error, Result};

/// Ordered groups of node ids
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Levels {
    levels: Vec<Vec<String>>,
}

impl Levels {
    /// Compute levels with Kahn's algorithm.
    ///
    /// `nodes` is `(id, dependencies)` in insertion order; ids within a level
    /// keep that order. Every dependency must name a node in `nodes`.
    pub(crate) fn compute<'a, I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let mut placed: HashSet<&str> = HashSet::with_capacity(nodes.len());
        let mut levels = Vec::new();

        while placed.len() < nodes.len() {
            let level: Vec<&str> = nodes
                .iter()
                .filter(|(id, _)| !placed.contains(id))
                .filter(|(_, deps)| deps.iter().all(|d| placed.contains(d.as_str())))
                .map(|(id, _)| *id)
                .collect();

            if level.is_empty() {
                let stuck: Vec<&str> = nodes
                    .iter()
                    .map(|(id, _)| *id)
                    .filter(|id| !placed.contains(id))
                    .collect();
                return Err(Error::CycleDetected(format!(
                    "cannot order nodes: {}",
                    stuck.join(", ")
                )));
            }

            debug!(level = levels.len(), nodes = level.len(), "Computed graph level");
            placed.extend(level.iter().copied());
            levels.push(level.into_iter().map(String::from).collect());
        }

        Ok(Self { levels })
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// True for an empty graph
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Iterate over levels in execution order
    pub fn iter(&self) -> impl Iterator<Item = &[String]> {
        self.levels.iter().map(Vec::as_slice)
    }

    /// All ids in a valid execution order
    pub fn flatten(&self) -> Vec<String> {
        self.levels.iter().flatten().cloned().collect()
    }
}
