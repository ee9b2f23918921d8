//! Core types for the reconciler.

use std::fmt;
use std::time::Duration;

use converge_core::ResourceKey;
use either::Either;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Machine-readable failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Conflict,
    Invalid,
    Forbidden,
    Unauthorized,
    RetriesExhausted,
    Cancelled,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a key failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "pass cancelled")
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    NoOp,
    Deleted,
    Failed(FailureReason),
}

impl Outcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed(FailureReason::new(kind, message))
    }

    /// Whether the outcome changed the cluster.
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub const fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::NoOp => "noop",
            Self::Deleted => "deleted",
            Self::Failed(_) => "failed",
        }
    }
}

/// Result of reconciling one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub key: ResourceKey,
    pub outcome: Outcome,
    /// Attempt number the key settled on, starting at 1. Zero when the task
    /// stopped before issuing any call.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl ReconcileResult {
    pub const fn new(key: ResourceKey, outcome: Outcome, attempts: u32, elapsed: Duration) -> Self {
        Self {
            key,
            outcome,
            attempts,
            elapsed,
        }
    }
}

/// Outcome counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub noop: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &Outcome) {
        let slot = match outcome {
            Outcome::Created => &mut self.created,
            Outcome::Updated => &mut self.updated,
            Outcome::NoOp => &mut self.noop,
            Outcome::Deleted => &mut self.deleted,
            Outcome::Failed(_) => &mut self.failed,
        };
        *slot = slot.saturating_add(1);
    }

    pub const fn writes(&self) -> usize {
        self.created
            .saturating_add(self.updated)
            .saturating_add(self.deleted)
    }
}

/// Everything one pass produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub results: Vec<ReconcileResult>,
    /// Keys whose task was superseded by a newer task for the same key.
    pub superseded: Vec<ResourceKey>,
    pub cancelled: bool,
    pub counts: OutcomeCounts,
    pub elapsed: Duration,
}

impl PassSummary {
    /// Create a new pass summary.
    pub fn new(
        results: Vec<ReconcileResult>,
        superseded: Vec<ResourceKey>,
        cancelled: bool,
        elapsed: Duration,
    ) -> Self {
        let counts = results.iter().fold(OutcomeCounts::default(), |mut acc, r| {
            acc.record(&r.outcome);
            acc
        });
        Self {
            results,
            superseded,
            cancelled,
            counts,
            elapsed,
        }
    }

    /// True when the pass completed and nothing needed changing.
    pub fn converged(&self) -> bool {
        !self.cancelled && self.counts.writes() == 0 && self.counts.failed == 0
    }

    pub fn result_for(&self, key: &ResourceKey) -> Option<&ReconcileResult> {
        self.results.iter().find(|r| &r.key == key)
    }

    pub fn outcome_for(&self, key: &ResourceKey) -> Option<&Outcome> {
        self.result_for(key).map(|r| &r.outcome)
    }

    /// Split results into settled keys and failures.
    pub fn partition(&self) -> (Vec<&ReconcileResult>, Vec<(&ResourceKey, &FailureReason)>) {
        self.results.iter().partition_map(|r| match &r.outcome {
            Outcome::Failed(reason) => Either::Right((&r.key, reason)),
            _ => Either::Left(r),
        })
    }

    /// Render the summary as JSON, for reports written by the control loop.
    ///
    /// # Errors
    ///
    /// Returns the serialization error, which only a broken writer produces.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
