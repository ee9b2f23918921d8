//! In-memory cluster.
//!
//! A [`ClusterClient`] backed by a map, with the server behaviors the driver
//! depends on: resourceVersion checks, uid and generation stamping, and
//! already-exists rejection. Faults can be scripted per operation and key,
//! and every call is counted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{DesiredResource, ExistingResource, KindRef, Resource, ResourceKey};
use tokio::sync::{Mutex, RwLock};

use crate::client::{ApiError, ApiResult, ClusterClient};

/// A cluster API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Create,
    Update,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Object(ResourceKey),
    Kind(KindRef),
}

const CREATION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

/// In-memory implementation of [`ClusterClient`].
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ResourceKey, Resource>>,
    faults: Mutex<HashMap<(Operation, Target), VecDeque<ApiError>>>,
    calls: Mutex<HashMap<(Operation, Target), usize>>,
    next_version: AtomicU64,
    latency: Option<Duration>,
}

impl InMemoryCluster {
    /// Create a new empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store an object as if it had been created earlier. Server fields the
    /// resource already carries are kept; missing ones are stamped.
    pub async fn seed(&self, resource: Resource) -> ExistingResource {
        let mut resource = resource;
        let version = self.bump();
        let meta = resource.metadata_mut();
        if meta.resource_version.is_none() {
            meta.resource_version = Some(version.to_string());
        }
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        meta.generation = meta.generation.or(Some(1));
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(CREATION_TIMESTAMP.to_string());
        }
        self.objects
            .write()
            .await
            .insert(resource.key().clone(), resource.clone());
        ExistingResource::new(resource)
    }

    /// Simulate another writer touching an object, so the next update with
    /// the old resourceVersion conflicts.
    pub async fn touch(&self, key: &ResourceKey) -> bool {
        let version = self.bump();
        let mut objects = self.objects.write().await;
        match objects.get_mut(key) {
            Some(object) => {
                object.metadata_mut().resource_version = Some(version.to_string());
                true
            }
            None => false,
        }
    }

    /// Snapshot of the stored object for `key`.
    pub async fn object(&self, key: &ResourceKey) -> Option<Resource> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Fail the next call of `op` on `key` with `error`.
    pub async fn fail_next(&self, op: Operation, key: &ResourceKey, error: ApiError) {
        self.fail_times(op, key, error, 1).await;
    }

    /// Fail the next `times` calls of `op` on `key` with `error`.
    pub async fn fail_times(&self, op: Operation, key: &ResourceKey, error: ApiError, times: usize) {
        self.script(op, Target::Object(key.clone()), error, times).await;
    }

    /// Fail the next list of `kind` with `error`.
    pub async fn fail_list(&self, kind: &KindRef, error: ApiError) {
        self.script(Operation::List, Target::Kind(kind.clone()), error, 1)
            .await;
    }

    /// Calls of `op` on `key`, including faulted ones.
    pub async fn calls_for(&self, op: Operation, key: &ResourceKey) -> usize {
        self.calls
            .lock()
            .await
            .get(&(op, Target::Object(key.clone())))
            .copied()
            .unwrap_or(0)
    }

    /// Calls of `op` across all keys.
    pub async fn calls(&self, op: Operation) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|((called, _), _)| *called == op)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Create, update and delete calls across all keys.
    pub async fn write_calls(&self) -> usize {
        let mut total = 0;
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            total += self.calls(op).await;
        }
        total
    }

    async fn script(&self, op: Operation, target: Target, error: ApiError, times: usize) {
        let mut faults = self.faults.lock().await;
        let queue = faults.entry((op, target)).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Count the call, wait out the latency, then pop a scripted fault.
    async fn enter(&self, op: Operation, target: Target) -> ApiResult<()> {
        {
            let mut calls = self.calls.lock().await;
            let count = calls.entry((op, target.clone())).or_insert(0);
            *count = count.saturating_add(1);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.faults.lock().await;
        match faults.get_mut(&(op, target)).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, key: &ResourceKey) -> ApiResult<ExistingResource> {
        self.enter(Operation::Get, Target::Object(key.clone())).await?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .map(ExistingResource::new)
            .ok_or_else(|| ApiError::not_found(key))
    }

    async fn create(&self, desired: &DesiredResource) -> ApiResult<ExistingResource> {
        let key = desired.key();
        self.enter(Operation::Create, Target::Object(key.clone())).await?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(ApiError::already_exists(key));
        }
        let version = self.bump();
        let mut created = desired.as_resource().clone();
        let meta = created.metadata_mut();
        meta.resource_version = Some(version.to_string());
        meta.uid = Some(format!("uid-{version}"));
        meta.generation = Some(1);
        meta.creation_timestamp = Some(CREATION_TIMESTAMP.to_string());
        objects.insert(key.clone(), created.clone());
        Ok(ExistingResource::new(created))
    }

    async fn update(
        &self,
        desired: &DesiredResource,
        resource_version: Option<&str>,
    ) -> ApiResult<ExistingResource> {
        let key = desired.key();
        self.enter(Operation::Update, Target::Object(key.clone())).await?;
        let mut objects = self.objects.write().await;
        let Some(current) = objects.get(key) else {
            return Err(ApiError::not_found(key));
        };
        if let Some(expected) = resource_version {
            if current.metadata().resource_version.as_deref() != Some(expected) {
                return Err(ApiError::stale(key));
            }
        }

        let version = self.bump();
        let current_meta = current.metadata().clone();
        let mut payload = desired.payload().clone();
        if let (Some(status), Some(map)) = (current.field("status"), payload.as_map_mut()) {
            map.entry("status".to_string()).or_insert_with(|| status.clone());
        }
        let spec_changed = current.field("spec") != payload.get("spec");

        let mut updated = desired
            .as_resource()
            .clone()
            .with_payload(payload)
            .map_err(|err| ApiError::Invalid(err.to_string()))?;
        let meta = updated.metadata_mut();
        meta.resource_version = Some(version.to_string());
        meta.uid = current_meta.uid;
        meta.creation_timestamp = current_meta.creation_timestamp;
        meta.deletion_timestamp = current_meta.deletion_timestamp;
        let generation = current_meta.generation.unwrap_or(1);
        meta.generation = Some(if spec_changed {
            generation.saturating_add(1)
        } else {
            generation
        });
        objects.insert(key.clone(), updated.clone());
        Ok(ExistingResource::new(updated))
    }

    async fn delete(&self, key: &ResourceKey) -> ApiResult<()> {
        self.enter(Operation::Delete, Target::Object(key.clone())).await?;
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(key))
    }

    async fn list(&self, api_version: &str, kind: &str) -> ApiResult<Vec<ExistingResource>> {
        self.enter(Operation::List, Target::Kind(KindRef::new(api_version, kind)))
            .await?;
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|r| r.key().api_version == api_version && r.key().kind == kind)
            .cloned()
            .map(ExistingResource::new)
            .collect())
    }
}
