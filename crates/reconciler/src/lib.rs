//! Level-triggered reconciliation of desired resources against a cluster.
//!
//! Every pass takes the full desired state and converges live state toward
//! it:
//!
//! - **Collection**: the ordered, duplicate-free set of desired resources
//! - **Equality**: per-kind comparators decide whether live state already
//!   satisfies the desired resource
//! - **Driver**: a bounded worker pool runs one state machine per key, then
//!   prunes what is no longer desired
//! - **Rollout**: workloads mounting a changed ConfigMap or Secret are
//!   forced to roll
//! - **Sink**: results, diffs and summaries go to the caller's sink
//!
//! # Key Concepts
//!
//! ## Per-key state machine
//!
//! `Planned -> Fetching -> {Creating | Updating | NoOp} -> Settled`, with
//! stale-version conflicts looping back to `Fetching` under a bounded attempt
//! counter. Pruning adds `Deleting` after every apply task is terminal.
//!
//! ## Failures
//!
//! Per-key failures are carried in that key's [`ReconcileResult`] with a
//! [`FailureKind`] code. Only invalid configuration, prune listing failures
//! and rejected credentials fail the pass.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use converge_reconciler::{InMemoryCluster, Reconciler, ResourceCollection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cluster = Arc::new(InMemoryCluster::new());
//!     let reconciler = Reconciler::builder().with_client(cluster).build()?;
//!
//!     let desired = ResourceCollection::from_manifests(include_str!("app.yaml"))?;
//!     let summary = reconciler.reconcile(&desired).await?;
//!     println!("converged: {}", summary.converged());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod client;
pub mod collection;
pub mod config;
pub mod diff;
pub mod driver;
pub mod equality;
pub mod error;
pub mod memory;
pub mod rollout;
pub mod shutdown;
pub mod sink;
pub mod types;

// Re-export main types
pub use client::{ApiError, ApiResult, ClusterClient, ConflictKind};
pub use collection::ResourceCollection;
pub use config::{PruneConfig, ReconcilerConfig, RetryConfig};
pub use diff::{Change, ChangeKind, ChangeSet, explain};
pub use driver::{
    InFlightRegistry, Lease, Reconciler, ReconcilerBuilder, RetryPolicy, calculate_backoff,
};
pub use equality::{
    Comparator, ComparisonProfile, DesiredFields, EqualityRegistry, FieldRules, FnComparator,
    MetadataOnly, SecretComparator, Structural, Subtree,
};
pub use error::{Error, Result};
pub use memory::{InMemoryCluster, Operation};
pub use rollout::ROLLOUT_ENV;
pub use shutdown::{CancelToken, PassCancellation};
pub use sink::{MemorySink, ReconcileSink, TracingSink};
pub use types::{
    FailureKind, FailureReason, Outcome, OutcomeCounts, PassSummary, ReconcileResult,
};
