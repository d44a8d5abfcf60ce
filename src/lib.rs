//! Crossmesh - multi-cloud Kubernetes bootstrap with a multi-primary service mesh
//!
//! Given one cluster spec per cloud, crossmesh makes sure each managed cluster
//! exists, installs a mesh control plane and east-west gateway on it, checks
//! readiness, and finally wires the control planes to discover each other.
//!
//! # Architecture
//!
//! Every cloud target becomes its own resource graph: a DAG of idempotent
//! operations executed level by level on a bounded worker pool. The graphs
//! run concurrently and share nothing mutable except a read-only mesh
//! identity. A failure in one branch never aborts another; partial success is
//! reported, not hidden.
//!
//! # Modules
//!
//! - [`graph`] - Resource graph: DAG validation, levels and execution
//! - [`provider`] - Cloud backend adapters (EKS, GKE)
//! - [`credentials`] - Cluster handles to client contexts, secret hygiene
//! - [`install`] - Chart installs through Helm
//! - [`cluster_api`] - Namespace, readiness check and remote secret operations
//! - [`readiness`] - Polling readiness verifier
//! - [`mesh`] - Mesh identity, chart values and the per-cluster install chain
//! - [`driver`] - Runs every branch and aggregates the [`result`]
//! - [`config`] - Run configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod cluster_api;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod exec;
pub mod graph;
pub mod install;
pub mod mesh;
pub mod poll;
pub mod provider;
pub mod readiness;
pub mod result;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
