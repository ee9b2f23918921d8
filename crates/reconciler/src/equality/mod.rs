//! Semantic equality between desired and existing resources.
//!
//! Each kind binds to a [`Comparator`] in the [`EqualityRegistry`]. Every
//! comparator runs the same outer algorithm:
//!
//! 1. Drop what the [`ComparisonProfile`] ignores from both payloads.
//!    Server-owned metadata never takes part, since it lives in dedicated
//!    [`ObjectMeta`] fields.
//! 2. Labels and annotations: every entry the desired sets must be present
//!    and equal on the existing object. Extra entries on the existing object
//!    are fine.
//! 3. Payload: the comparator's own strategy decides.
//!
//! The result is the conjunction of 2 and 3.

mod builtin;
mod registry;
mod structural;

use std::collections::BTreeMap;

use converge_core::{DesiredResource, ExistingResource, FieldPath, ObjectMeta, Value};

pub use builtin::{
    DesiredFields, FnComparator, KUBED_SYNC_ANNOTATION, MetadataOnly, SecretComparator,
    Structural, Subtree,
};
pub use registry::EqualityRegistry;
pub use structural::{FieldRules, desired_subset, values_equal};

/// The annotation kubectl writes on every apply.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// What a comparator leaves out of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonProfile {
    /// Payload paths removed from both sides before comparing.
    pub ignored_paths: Vec<FieldPath>,
    /// Annotation keys never compared.
    pub ignored_annotations: Vec<String>,
    /// Annotation key prefixes never compared.
    pub ignored_annotation_prefixes: Vec<String>,
    /// Sequence entries dropped by their `name` field, per sequence path.
    pub ignored_entries: Vec<(FieldPath, String)>,
    pub compare_labels: bool,
    pub compare_annotations: bool,
}

impl Default for ComparisonProfile {
    fn default() -> Self {
        Self {
            ignored_paths: vec![FieldPath::parse("status")],
            ignored_annotations: vec![LAST_APPLIED_ANNOTATION.to_string()],
            ignored_annotation_prefixes: vec!["deployment.kubernetes.io/".to_string()],
            ignored_entries: Vec::new(),
            compare_labels: true,
            compare_annotations: true,
        }
    }
}

impl ComparisonProfile {
    #[must_use]
    pub fn ignore_path(mut self, path: impl Into<FieldPath>) -> Self {
        self.ignored_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn ignore_annotation(mut self, key: impl Into<String>) -> Self {
        self.ignored_annotations.push(key.into());
        self
    }

    #[must_use]
    pub fn ignore_annotation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_annotation_prefixes.push(prefix.into());
        self
    }

    /// Leave out entries named `name` from every sequence matched by `path`.
    #[must_use]
    pub fn ignore_named_entry(mut self, path: impl Into<FieldPath>, name: impl Into<String>) -> Self {
        self.ignored_entries.push((path.into(), name.into()));
        self
    }

    #[must_use]
    pub const fn without_labels(mut self) -> Self {
        self.compare_labels = false;
        self
    }

    #[must_use]
    pub const fn without_annotations(mut self) -> Self {
        self.compare_annotations = false;
        self
    }

    pub fn is_annotation_ignored(&self, key: &str) -> bool {
        self.ignored_annotations.iter().any(|k| k == key)
            || self
                .ignored_annotation_prefixes
                .iter()
                .any(|prefix| key.starts_with(prefix.as_str()))
    }

    /// A copy of `payload` with the ignored paths removed.
    pub fn sanitize(&self, payload: &Value) -> Value {
        let mut cleaned = payload.clone();
        for path in &self.ignored_paths {
            cleaned.remove_matching(path);
        }
        for (path, name) in &self.ignored_entries {
            cleaned.for_each_matching_mut(path, &mut |node| {
                if let Value::Sequence(items) = node {
                    items.retain(|item| item.get("name").and_then(Value::as_str) != Some(name.as_str()));
                }
            });
        }
        cleaned
    }

    /// Labels and annotations subset test.
    pub fn metadata_subset(&self, desired: &ObjectMeta, existing: &ObjectMeta) -> bool {
        let labels_ok = !self.compare_labels || is_subset(&desired.labels, &existing.labels, |_| false);
        let annotations_ok = !self.compare_annotations
            || is_subset(&desired.annotations, &existing.annotations, |key| {
                self.is_annotation_ignored(key)
            });
        labels_ok && annotations_ok
    }
}

fn is_subset<F>(
    desired: &BTreeMap<String, String>,
    existing: &BTreeMap<String, String>,
    skip: F,
) -> bool
where
    F: Fn(&str) -> bool,
{
    desired
        .iter()
        .filter(|(key, _)| !skip(key))
        .all(|(key, value)| existing.get(key) == Some(value))
}

/// A comparison strategy for one kind.
pub trait Comparator: Send + Sync {
    /// What this comparator ignores.
    fn profile(&self) -> &ComparisonProfile;

    /// Compare payloads that have already been sanitized by the profile.
    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool;

    /// Full comparison of a desired against an existing resource.
    fn equal(&self, desired: &DesiredResource, existing: &ExistingResource) -> bool {
        standard_equal(self, desired, existing)
    }
}

/// Metadata subset test, then the comparator's payload strategy over
/// sanitized payloads.
pub(crate) fn standard_equal<C>(
    comparator: &C,
    desired: &DesiredResource,
    existing: &ExistingResource,
) -> bool
where
    C: Comparator + ?Sized,
{
    let profile = comparator.profile();
    profile.metadata_subset(desired.metadata(), existing.metadata())
        && comparator.payload_equal(
            &profile.sanitize(desired.payload()),
            &profile.sanitize(existing.payload()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            annotations: annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn test_label_superset_rule() {
        let profile = ComparisonProfile::default();
        assert!(profile.metadata_subset(
            &meta(&[("a", "1")], &[]),
            &meta(&[("a", "1"), ("b", "2")], &[])
        ));
        assert!(!profile.metadata_subset(
            &meta(&[("a", "1"), ("c", "3")], &[]),
            &meta(&[("a", "1")], &[])
        ));
    }

    #[test]
    fn test_ignored_annotations() {
        let profile = ComparisonProfile::default();
        assert!(profile.metadata_subset(
            &meta(&[], &[(LAST_APPLIED_ANNOTATION, "{}"), ("deployment.kubernetes.io/revision", "3")]),
            &meta(&[], &[])
        ));
        assert!(!profile.metadata_subset(&meta(&[], &[("team", "obs")]), &meta(&[], &[])));
        assert!(profile
            .without_annotations()
            .metadata_subset(&meta(&[], &[("team", "obs")]), &meta(&[], &[])));
    }

    #[test]
    fn test_sanitize_drops_status() {
        let payload: Value = [
            ("spec".to_string(), Value::from("a")),
            ("status".to_string(), Value::from("ready")),
        ]
        .into_iter()
        .collect();
        let cleaned = ComparisonProfile::default().sanitize(&payload);
        assert!(cleaned.get("status").is_none());
        assert!(cleaned.get("spec").is_some());
    }

    #[test]
    fn test_sanitize_drops_named_entries() {
        let payload = converge_core::from_json_str(
            r#"{"env": [{"name": "KEEP", "value": "1"}, {"name": "DROP", "value": "2"}]}"#,
        )
        .unwrap();
        let cleaned = ComparisonProfile::default()
            .ignore_named_entry("env", "DROP")
            .sanitize(&payload);
        let names: Vec<_> = cleaned
            .get("env")
            .and_then(Value::as_sequence)
            .unwrap()
            .iter()
            .filter_map(|entry| entry.get("name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["KEEP"]);
    }
}
