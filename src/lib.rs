#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # converge
//!
//! Declarative resource reconciliation for cluster controllers.
//!
//! This library re-exports the converge workspace crates for convenience.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Re-export all crates
pub use converge_core;
pub use converge_reconciler;

pub use converge_core::{
    DesiredResource, ExistingResource, Management, Resource, ResourceKey, Value,
};
pub use converge_reconciler::{
    ClusterClient, EqualityRegistry, Outcome, PassCancellation, PassSummary, ReconcileSink,
    Reconciler, ReconcilerConfig, ResourceCollection,
};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (for example `"info,converge_reconciler=debug"`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
