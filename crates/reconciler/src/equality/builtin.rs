//! Built-in comparison strategies.

use converge_core::{DesiredResource, ExistingResource, PathSegment, Value};

use super::structural::{FieldRules, desired_subset, values_equal};
use super::{Comparator, ComparisonProfile, standard_equal};

/// Secrets carrying this annotation are synced by another controller.
pub const KUBED_SYNC_ANNOTATION: &str = "kubed.appscode.com/sync";

/// Strict deep equality over the whole payload. The default strategy.
#[derive(Debug, Clone, Default)]
pub struct Structural {
    profile: ComparisonProfile,
    rules: FieldRules,
}

impl Structural {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ComparisonProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: FieldRules) -> Self {
        self.rules = rules;
        self
    }
}

impl Comparator for Structural {
    fn profile(&self) -> &ComparisonProfile {
        &self.profile
    }

    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool {
        values_equal(desired, existing, &self.rules, &mut Vec::new())
    }
}

/// Strict equality over named top-level payload fields only.
#[derive(Debug, Clone)]
pub struct Subtree {
    fields: Vec<String>,
    profile: ComparisonProfile,
    rules: FieldRules,
}

impl Subtree {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            profile: ComparisonProfile::default(),
            rules: FieldRules::default(),
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ComparisonProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: FieldRules) -> Self {
        self.rules = rules;
        self
    }

    /// Keep only the compared fields, so locations still start at the
    /// payload root.
    fn project(&self, payload: &Value) -> Value {
        self.fields
            .iter()
            .filter_map(|field| payload.get(field).map(|v| (field.clone(), v.clone())))
            .collect()
    }
}

impl Comparator for Subtree {
    fn profile(&self) -> &ComparisonProfile {
        &self.profile
    }

    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool {
        values_equal(
            &self.project(desired),
            &self.project(existing),
            &self.rules,
            &mut Vec::new(),
        )
    }
}

/// Compare only fields the desired document sets, under named top-level
/// payload fields.
#[derive(Debug, Clone)]
pub struct DesiredFields {
    fields: Vec<String>,
    profile: ComparisonProfile,
    rules: FieldRules,
}

impl DesiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            profile: ComparisonProfile::default(),
            rules: FieldRules::default(),
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ComparisonProfile) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_rules(mut self, rules: FieldRules) -> Self {
        self.rules = rules;
        self
    }
}

impl Comparator for DesiredFields {
    fn profile(&self) -> &ComparisonProfile {
        &self.profile
    }

    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool {
        self.fields.iter().all(|field| {
            let mut location = vec![PathSegment::Key(field.clone())];
            match (desired.get(field), existing.get(field)) {
                (Some(want), Some(have)) => desired_subset(want, have, &self.rules, &mut location),
                (Some(want), None) => want.is_empty(),
                (None, _) => true,
            }
        })
    }
}

/// Ignore the payload; only labels and annotations are compared.
#[derive(Debug, Clone, Default)]
pub struct MetadataOnly {
    profile: ComparisonProfile,
}

impl MetadataOnly {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ComparisonProfile) -> Self {
        self.profile = profile;
        self
    }
}

impl Comparator for MetadataOnly {
    fn profile(&self) -> &ComparisonProfile {
        &self.profile
    }

    fn payload_equal(&self, _desired: &Value, _existing: &Value) -> bool {
        true
    }
}

/// Payload comparison through a closure.
pub struct FnComparator<F> {
    profile: ComparisonProfile,
    compare: F,
}

impl<F> FnComparator<F>
where
    F: Fn(&Value, &Value) -> bool + Send + Sync,
{
    pub fn new(compare: F) -> Self {
        Self {
            profile: ComparisonProfile::default(),
            compare,
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ComparisonProfile) -> Self {
        self.profile = profile;
        self
    }
}

impl<F> Comparator for FnComparator<F>
where
    F: Fn(&Value, &Value) -> bool + Send + Sync,
{
    fn profile(&self) -> &ComparisonProfile {
        &self.profile
    }

    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool {
        (self.compare)(desired, existing)
    }
}

/// Secrets compare `data` and `stringData`, and are always equal while the
/// desired secret is marked for kubed sync.
#[derive(Debug, Clone)]
pub struct SecretComparator {
    inner: Subtree,
}

impl SecretComparator {
    pub fn new() -> Self {
        Self {
            inner: Subtree::new(["data", "stringData"]).with_rules(
                FieldRules::new()
                    .absent_as_empty("data")
                    .absent_as_empty("stringData"),
            ),
        }
    }
}

impl Default for SecretComparator {
    fn default() -> Self {
        Self::new()
    }
}

impl Comparator for SecretComparator {
    fn profile(&self) -> &ComparisonProfile {
        self.inner.profile()
    }

    fn payload_equal(&self, desired: &Value, existing: &Value) -> bool {
        self.inner.payload_equal(desired, existing)
    }

    fn equal(&self, desired: &DesiredResource, existing: &ExistingResource) -> bool {
        if desired
            .metadata()
            .annotations
            .contains_key(KUBED_SYNC_ANNOTATION)
        {
            return true;
        }
        standard_equal(self, desired, existing)
    }
}
