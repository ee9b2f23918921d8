//! Error types for the reconciler crate.
//!
//! These are pass-level errors. Per-key failures never surface here; they are
//! carried in that key's [`ReconcileResult`](crate::types::ReconcileResult).

use std::fmt;

use converge_core::{KindRef, ResourceKey};

use crate::client::ApiError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug)]
pub enum Error {
    /// Configuration failed validation or could not be parsed.
    InvalidConfig { reason: String },
    /// Listing a prune kind failed; pruning was not attempted.
    ListFailed { kind: KindRef, source: ApiError },
    /// Credentials were rejected and the pass was aborted.
    Unauthorized { key: ResourceKey, reason: String },
    /// A document or collection operation failed.
    Document(converge_core::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::ListFailed { kind, source } => {
                write!(f, "listing {kind} for pruning failed: {source}")
            }
            Self::Unauthorized { key, reason } => {
                write!(f, "pass aborted, credentials rejected while reconciling {key}: {reason}")
            }
            Self::Document(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ListFailed { source, .. } => Some(source),
            Self::Document(err) => Some(err),
            Self::InvalidConfig { .. } | Self::Unauthorized { .. } => None,
        }
    }
}

impl Error {
    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a list failed error.
    pub const fn list_failed(kind: KindRef, source: ApiError) -> Self {
        Self::ListFailed { kind, source }
    }

    /// Create an unauthorized escalation error.
    pub fn unauthorized(key: ResourceKey, reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            key,
            reason: reason.into(),
        }
    }
}

impl From<converge_core::Error> for Error {
    fn from(err: converge_core::Error) -> Self {
        Self::Document(err)
    }
}
