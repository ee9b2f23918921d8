//! Cluster client boundary.
//!
//! The driver talks to the cluster only through [`ClusterClient`]. Every call
//! returns an [`ApiError`] on failure, classified so the driver can decide
//! between retrying, re-fetching and failing the key.

use std::time::Duration;

use async_trait::async_trait;
use converge_core::{DesiredResource, ExistingResource, ResourceKey};
use thiserror::Error;

use crate::types::FailureKind;

/// Result type for cluster calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Why a write was rejected as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Create found an object with the same key.
    AlreadyExists,
    /// Update carried a resourceVersion that is no longer current.
    StaleResourceVersion,
}

/// Errors returned by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict ({kind:?}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    #[error("rejected as invalid: {0}")]
    Invalid(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn not_found(key: &ResourceKey) -> Self {
        Self::NotFound(key.to_string())
    }

    pub fn already_exists(key: &ResourceKey) -> Self {
        Self::Conflict {
            kind: ConflictKind::AlreadyExists,
            message: format!("{key} already exists"),
        }
    }

    pub fn stale(key: &ResourceKey) -> Self {
        Self::Conflict {
            kind: ConflictKind::StaleResourceVersion,
            message: format!("{key} was modified since it was read"),
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            Self::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Errors worth retrying unchanged after a backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }

    /// The failure code recorded when this error settles a key.
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Conflict { .. } | Self::NotFound(_) => FailureKind::Conflict,
            Self::Invalid(_) => FailureKind::Invalid,
            Self::Forbidden(_) => FailureKind::Forbidden,
            Self::Unauthorized(_) => FailureKind::Unauthorized,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_) | Self::Transport(_) => {
                FailureKind::RetriesExhausted
            }
        }
    }
}

/// Access to the cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the live object for a key.
    async fn get(&self, key: &ResourceKey) -> ApiResult<ExistingResource>;

    /// Create an object. Fails with `Conflict(AlreadyExists)` if present.
    async fn create(&self, desired: &DesiredResource) -> ApiResult<ExistingResource>;

    /// Replace an object, guarded by the resourceVersion read beforehand.
    async fn update(
        &self,
        desired: &DesiredResource,
        resource_version: Option<&str>,
    ) -> ApiResult<ExistingResource>;

    /// Delete an object.
    async fn delete(&self, key: &ResourceKey) -> ApiResult<()>;

    /// List every object of a kind, across namespaces.
    async fn list(&self, api_version: &str, kind: &str) -> ApiResult<Vec<ExistingResource>>;
}
