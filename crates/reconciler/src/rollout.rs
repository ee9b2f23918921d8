//! Workload rollouts on mounted configuration changes.
//!
//! A pod does not see a changed ConfigMap or Secret mounted as a volume
//! until it restarts, so a pass that updates one also forces an update of
//! every desired Deployment, StatefulSet and DaemonSet that mounts it. The
//! forced update stamps [`ROLLOUT_ENV`] on every container with a hash of
//! the changed sources, which changes the pod template and makes the
//! cluster roll the workload. Comparators leave the variable out, so a
//! stamped workload compares equal to its unstamped desired document.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use converge_core::{DesiredResource, FieldPath, ResourceKey, Value};
use sha2::{Digest, Sha256};

/// Container env variable carrying the rollout hash.
pub const ROLLOUT_ENV: &str = "CONVERGE_ROLLOUT_HASH";

const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet"];

/// Volume name paths under a pod template, with the kind they point at.
const MOUNT_PATHS: &[(&str, &str)] = &[
    ("spec.template.spec.volumes[].configMap.name", "ConfigMap"),
    ("spec.template.spec.volumes[].secret.secretName", "Secret"),
    (
        "spec.template.spec.volumes[].projected.sources[].configMap.name",
        "ConfigMap",
    ),
    (
        "spec.template.spec.volumes[].projected.sources[].secret.name",
        "Secret",
    ),
];

/// Whether `key` names a kind that runs pods from a template.
pub fn is_workload(key: &ResourceKey) -> bool {
    WORKLOAD_KINDS.contains(&key.kind.as_str())
}

/// Whether `key` names a kind pods can mount as a volume.
pub fn is_volume_source(key: &ResourceKey) -> bool {
    key.api_version == "v1" && matches!(key.kind.as_str(), "ConfigMap" | "Secret")
}

/// ConfigMaps and Secrets a workload mounts, in the workload's namespace.
pub fn mounted_sources(workload: &DesiredResource) -> BTreeSet<ResourceKey> {
    let key = workload.key();
    let Some(namespace) = key.namespace.as_deref() else {
        return BTreeSet::new();
    };
    MOUNT_PATHS
        .iter()
        .flat_map(|(path, kind)| {
            workload
                .payload()
                .select(&FieldPath::parse(path))
                .into_iter()
                .filter_map(|(_, name)| name.as_str())
                .map(move |name| ResourceKey::namespaced("v1", *kind, namespace, name))
        })
        .collect()
}

/// Stable digest of the sources' desired content.
pub fn content_hash<'a, I>(sources: I) -> String
where
    I: IntoIterator<Item = &'a DesiredResource>,
{
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.key().to_string().as_bytes());
        hasher.update(source.payload().to_string().as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().take(8).fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// A copy of `workload` with [`ROLLOUT_ENV`] set to `hash` on every
/// container.
pub fn stamp(workload: &DesiredResource, hash: &str) -> DesiredResource {
    let mut resource = workload.as_resource().clone();
    let containers = FieldPath::parse("template.spec.containers[]");
    if let Some(spec) = resource.field_mut("spec") {
        spec.for_each_matching_mut(&containers, &mut |container| {
            stamp_container(container, hash);
        });
    }
    DesiredResource::new(resource)
}

fn stamp_container(container: &mut Value, hash: &str) {
    let Some(fields) = container.as_map_mut() else {
        return;
    };
    let env = fields
        .entry("env".to_string())
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if !matches!(env, Value::Sequence(_)) {
        *env = Value::Sequence(Vec::new());
    }
    if let Value::Sequence(entries) = env {
        entries.retain(|entry| entry.get("name").and_then(Value::as_str) != Some(ROLLOUT_ENV));
        entries.push(
            [
                ("name".to_string(), Value::from(ROLLOUT_ENV)),
                ("value".to_string(), Value::from(hash)),
            ]
            .into_iter()
            .collect(),
        );
    }
}

/// The stamped workloads among `candidates` that mount any of `changed`.
/// Workloads marked no-update are left alone.
pub fn plan<'a, I>(
    candidates: I,
    changed: &BTreeMap<ResourceKey, DesiredResource>,
) -> Vec<DesiredResource>
where
    I: IntoIterator<Item = &'a DesiredResource>,
{
    if changed.is_empty() {
        return Vec::new();
    }
    candidates
        .into_iter()
        .filter(|workload| is_workload(workload.key()) && !workload.as_resource().is_immutable())
        .filter_map(|workload| {
            let mounted: Vec<&DesiredResource> = mounted_sources(workload)
                .iter()
                .filter_map(|source| changed.get(source))
                .collect();
            (!mounted.is_empty()).then(|| stamp(workload, &content_hash(mounted)))
        })
        .collect()
}
