//! Kind-to-comparator dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use converge_core::{DesiredResource, ExistingResource, OptionExt};
use tracing::debug;

use super::builtin::{DesiredFields, MetadataOnly, SecretComparator, Structural, Subtree};
use super::structural::FieldRules;
use super::{Comparator, ComparisonProfile};
use crate::rollout::ROLLOUT_ENV;

/// Maps a kind to its comparison strategy.
///
/// Built once, then shared behind an `Arc` and read without locking.
#[derive(Clone)]
pub struct EqualityRegistry {
    comparators: HashMap<String, Arc<dyn Comparator>>,
    fallback: Arc<dyn Comparator>,
}

impl EqualityRegistry {
    /// An empty registry; every kind uses [`Structural`].
    pub fn new() -> Self {
        Self {
            comparators: HashMap::new(),
            fallback: Arc::new(Structural::new()),
        }
    }

    /// A registry with the built-in per-kind strategies.
    pub fn standard() -> Self {
        let pod_template_rules = FieldRules::new()
            .absent_as_empty("spec.template.spec.containers[].env[].value")
            .absent_as_empty("spec.template.spec.initContainers[].env[].value");
        let workload = || {
            DesiredFields::new(["spec"])
                .with_rules(pod_template_rules.clone())
                .with_profile(
                    ComparisonProfile::default()
                        .ignore_named_entry("spec.template.spec.containers[].env", ROLLOUT_ENV),
                )
        };

        let mut registry = Self::new();
        registry.register("Deployment", workload());
        registry.register("StatefulSet", workload());
        registry.register("DaemonSet", workload());
        registry.register("Service", DesiredFields::new(["spec"]));
        registry.register("CustomResourceDefinition", DesiredFields::new(["spec"]));
        registry.register(
            "ConfigMap",
            Subtree::new(["data", "binaryData"]).with_rules(
                FieldRules::new()
                    .absent_as_empty("data")
                    .absent_as_empty("binaryData"),
            ),
        );
        registry.register("Secret", SecretComparator::new());
        for kind in ["ClusterRole", "Role"] {
            registry.register(kind, Subtree::new(["rules", "aggregationRule"]));
        }
        for kind in ["Prometheus", "Alertmanager"] {
            registry.register(kind, Subtree::new(["spec"]));
        }
        for kind in [
            "Namespace",
            "ServiceAccount",
            "PersistentVolumeClaim",
            "StorageClass",
            "RoleBinding",
            "ClusterRoleBinding",
        ] {
            registry.register(kind, MetadataOnly::new());
        }
        registry
    }

    /// Replace the comparator used for unregistered kinds.
    #[must_use]
    pub fn with_default(mut self, comparator: impl Comparator + 'static) -> Self {
        self.fallback = Arc::new(comparator);
        self
    }

    /// Bind a comparator to a kind. The last registration wins.
    pub fn register(&mut self, kind: impl Into<String>, comparator: impl Comparator + 'static) {
        self.comparators.insert(kind.into(), Arc::new(comparator));
    }

    /// Whether a kind has its own comparator.
    pub fn contains(&self, kind: &str) -> bool {
        self.comparators.contains_key(kind)
    }

    /// The comparator for `kind`, or the default.
    pub fn comparator_for(&self, kind: &str) -> &dyn Comparator {
        self.comparators
            .get(kind)
            .tap_none(|| debug!(kind, "No comparator registered, using default"))
            .map_or(self.fallback.as_ref(), AsRef::as_ref)
    }

    /// Decide whether `existing` already satisfies `desired`.
    pub fn compare(
        &self,
        kind: &str,
        desired: &DesiredResource,
        existing: &ExistingResource,
    ) -> bool {
        self.comparator_for(kind).equal(desired, existing)
    }
}

impl Default for EqualityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EqualityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.comparators.keys().collect();
        kinds.sort();
        f.debug_struct("EqualityRegistry")
            .field("kinds", &kinds)
            .finish_non_exhaustive()
    }
}
