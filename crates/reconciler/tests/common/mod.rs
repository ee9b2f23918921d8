//! Shared fixtures for reconciler integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use converge_core::{MANAGED_ANNOTATION, Resource, ResourceKey, Value, from_json_str};
use converge_reconciler::{
    ClusterClient, InMemoryCluster, MemorySink, ReconcileSink, Reconciler, ReconcilerConfig,
    ResourceCollection,
};

/// Parse a JSON document into a resource.
pub fn resource(json: &str) -> anyhow::Result<Resource> {
    Ok(Resource::from_value(from_json_str(json)?)?)
}

pub fn configmap(namespace: &str, name: &str, value: &str) -> Resource {
    let data: Value = [("value".to_string(), Value::from(value))]
        .into_iter()
        .collect();
    Resource::new(ResourceKey::namespaced("v1", "ConfigMap", namespace, name))
        .with_field("data", data)
}

pub fn configmap_key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::namespaced("v1", "ConfigMap", namespace, name)
}

pub fn prometheus(field: &str, value: &str) -> Resource {
    let spec: Value = [(field.to_string(), Value::from(value))].into_iter().collect();
    Resource::new(prometheus_key()).with_field("spec", spec)
}

pub fn prometheus_key() -> ResourceKey {
    ResourceKey::namespaced("monitoring.coreos.com/v1", "Prometheus", "monitoring", "k8s")
}

/// The same resource as it looks after an earlier pass created it.
pub fn owned(resource: Resource) -> Resource {
    resource.with_annotation(MANAGED_ANNOTATION, "owned")
}

pub fn collection(resources: impl IntoIterator<Item = Resource>) -> anyhow::Result<ResourceCollection> {
    let mut collection = ResourceCollection::new();
    for resource in resources {
        collection.add(resource)?;
    }
    Ok(collection)
}

/// Millisecond backoff without jitter, so retry tests stay fast.
pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig::default().backoff(1, 5).jitter(false)
}

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub sink: Arc<MemorySink>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(config: ReconcilerConfig) -> anyhow::Result<Self> {
        Self::with_cluster(InMemoryCluster::new(), config)
    }

    pub fn with_cluster(cluster: InMemoryCluster, config: ReconcilerConfig) -> anyhow::Result<Self> {
        let cluster = Arc::new(cluster);
        let sink = Arc::new(MemorySink::new());
        let reconciler = Reconciler::builder()
            .with_client(Arc::clone(&cluster) as Arc<dyn ClusterClient>)
            .with_sink(Arc::clone(&sink) as Arc<dyn ReconcileSink>)
            .with_config(config)
            .build()?;
        Ok(Self {
            cluster,
            sink,
            reconciler,
        })
    }
}
