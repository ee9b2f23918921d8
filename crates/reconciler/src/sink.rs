//! Observability sinks.
//!
//! The driver reports through a [`ReconcileSink`] instead of logging
//! directly, so the control loop decides where results and diffs go.

use std::sync::Mutex;

use converge_core::ResourceKey;
use tracing::{debug, info, warn};

use crate::diff::ChangeSet;
use crate::types::{Outcome, PassSummary, ReconcileResult};

/// Receives per-key results, diffs and pass summaries.
pub trait ReconcileSink: Send + Sync {
    /// Called once per settled key.
    fn on_result(&self, result: &ReconcileResult);

    /// Called before an update is issued.
    fn on_diff(&self, changes: &ChangeSet);

    /// Called when a task was superseded by a newer task for the same key.
    fn on_superseded(&self, _key: &ResourceKey) {}

    /// Called once at the end of a pass that was not aborted.
    fn on_summary(&self, summary: &PassSummary);
}

/// Renders everything as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReconcileSink for TracingSink {
    fn on_result(&self, result: &ReconcileResult) {
        match &result.outcome {
            Outcome::Failed(reason) => warn!(
                key = %result.key,
                kind = %reason.kind,
                attempts = result.attempts,
                error = %reason.message,
                "Reconcile failed"
            ),
            Outcome::NoOp => debug!(key = %result.key, "Already converged"),
            outcome => info!(
                key = %result.key,
                outcome = outcome.label(),
                attempts = result.attempts,
                elapsed_ms = u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
                "Reconciled"
            ),
        }
    }

    fn on_diff(&self, changes: &ChangeSet) {
        info!(key = %changes.key, changes = changes.len(), diff = %changes.render(), "Updating resource");
    }

    fn on_superseded(&self, key: &ResourceKey) {
        debug!(key = %key, "Task superseded by a newer pass");
    }

    fn on_summary(&self, summary: &PassSummary) {
        info!(
            created = summary.counts.created,
            updated = summary.counts.updated,
            noop = summary.counts.noop,
            deleted = summary.counts.deleted,
            failed = summary.counts.failed,
            superseded = summary.superseded.len(),
            cancelled = summary.cancelled,
            converged = summary.converged(),
            "Reconciliation pass complete"
        );
    }
}

/// Keeps everything in memory. Useful in tests and for callers that want to
/// inspect diffs after a pass.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<ReconcileResult>>,
    diffs: Mutex<Vec<ChangeSet>>,
    superseded: Mutex<Vec<ResourceKey>>,
    summaries: Mutex<Vec<PassSummary>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<ReconcileResult> {
        snapshot(&self.results)
    }

    pub fn diffs(&self) -> Vec<ChangeSet> {
        snapshot(&self.diffs)
    }

    pub fn superseded(&self) -> Vec<ResourceKey> {
        snapshot(&self.superseded)
    }

    pub fn summaries(&self) -> Vec<PassSummary> {
        snapshot(&self.summaries)
    }
}

fn snapshot<T: Clone>(slot: &Mutex<Vec<T>>) -> Vec<T> {
    slot.lock().map(|items| items.clone()).unwrap_or_default()
}

fn record<T>(slot: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut items) = slot.lock() {
        items.push(item);
    }
}

impl ReconcileSink for MemorySink {
    fn on_result(&self, result: &ReconcileResult) {
        record(&self.results, result.clone());
    }

    fn on_diff(&self, changes: &ChangeSet) {
        record(&self.diffs, changes.clone());
    }

    fn on_superseded(&self, key: &ResourceKey) {
        record(&self.superseded, key.clone());
    }

    fn on_summary(&self, summary: &PassSummary) {
        record(&self.summaries, summary.clone());
    }
}
