//! Recursive value comparison.
//!
//! Two walks over the [`Value`] model share one set of [`FieldRules`]:
//!
//! - [`values_equal`] is strict deep equality.
//! - [`desired_subset`] only inspects fields the desired side sets, so values
//!   the cluster defaulted inside authored objects are ignored.
//!
//! Maps compare key-by-key regardless of order. Sequences compare by position
//! unless their location is declared order-insensitive. Scalars compare by
//! value and type. An absent key differs from a present empty value unless
//! the location is declared absent-as-empty.

use converge_core::{FieldPath, PathSegment, Value};

/// Location-scoped exceptions to strict comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRules {
    order_insensitive: Vec<FieldPath>,
    absent_as_empty: Vec<FieldPath>,
}

impl FieldRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the sequence at `path` as a multiset.
    #[must_use]
    pub fn order_insensitive(mut self, path: impl Into<FieldPath>) -> Self {
        self.order_insensitive.push(path.into());
        self
    }

    /// Treat an empty value at `path` the same as the key being absent.
    #[must_use]
    pub fn absent_as_empty(mut self, path: impl Into<FieldPath>) -> Self {
        self.absent_as_empty.push(path.into());
        self
    }

    fn is_order_insensitive(&self, location: &[PathSegment]) -> bool {
        self.order_insensitive.iter().any(|p| p.matches(location))
    }

    fn is_absent_as_empty(&self, location: &[PathSegment]) -> bool {
        self.absent_as_empty.iter().any(|p| p.matches(location))
    }
}

/// Strict deep equality of two values rooted at `location`.
pub fn values_equal(
    desired: &Value,
    existing: &Value,
    rules: &FieldRules,
    location: &mut Vec<PathSegment>,
) -> bool {
    match (desired, existing) {
        (Value::Map(left), Value::Map(right)) => {
            let keys = left
                .keys()
                .chain(right.keys().filter(|k| !left.contains_key(*k)));
            for key in keys {
                location.push(PathSegment::Key(key.clone()));
                let equal = match (left.get(key), right.get(key)) {
                    (Some(a), Some(b)) => values_equal(a, b, rules, location),
                    (Some(only), None) | (None, Some(only)) => {
                        rules.is_absent_as_empty(location) && only.is_empty()
                    }
                    (None, None) => true,
                };
                location.pop();
                if !equal {
                    return false;
                }
            }
            true
        }
        (Value::Sequence(left), Value::Sequence(right)) => {
            if left.len() != right.len() {
                return false;
            }
            if rules.is_order_insensitive(location) {
                return multiset_match(left, right, |a, b, loc| values_equal(a, b, rules, loc), location);
            }
            positional_match(left, right, |a, b, loc| values_equal(a, b, rules, loc), location)
        }
        (a, b) => a == b,
    }
}

/// Whether every field set in `desired` is present and equal in `existing`.
///
/// Sequences must still have the same length; their elements are compared
/// with the same subset rule.
pub fn desired_subset(
    desired: &Value,
    existing: &Value,
    rules: &FieldRules,
    location: &mut Vec<PathSegment>,
) -> bool {
    match (desired, existing) {
        (Value::Map(left), Value::Map(right)) => left.iter().all(|(key, want)| {
            location.push(PathSegment::Key(key.clone()));
            let equal = match right.get(key) {
                Some(have) => desired_subset(want, have, rules, location),
                None => rules.is_absent_as_empty(location) && want.is_empty(),
            };
            location.pop();
            equal
        }),
        (Value::Sequence(left), Value::Sequence(right)) => {
            if left.len() != right.len() {
                return false;
            }
            if rules.is_order_insensitive(location) {
                return multiset_match(left, right, |a, b, loc| desired_subset(a, b, rules, loc), location);
            }
            positional_match(left, right, |a, b, loc| desired_subset(a, b, rules, loc), location)
        }
        (Value::Map(left), Value::Null) => {
            left.is_empty() && rules.is_absent_as_empty(location)
        }
        (a, b) => a == b,
    }
}

fn positional_match<F>(
    left: &[Value],
    right: &[Value],
    mut eq: F,
    location: &mut Vec<PathSegment>,
) -> bool
where
    F: FnMut(&Value, &Value, &mut Vec<PathSegment>) -> bool,
{
    left.iter().zip(right).enumerate().all(|(i, (a, b))| {
        location.push(PathSegment::Index(i));
        let equal = eq(a, b, location);
        location.pop();
        equal
    })
}

/// Match each left element to a distinct right element.
///
/// The element test need not be an equivalence (a desired subset can fit
/// several existing elements), so this is a bipartite matching rather than
/// a first-fit scan.
fn multiset_match<F>(
    left: &[Value],
    right: &[Value],
    mut eq: F,
    location: &mut Vec<PathSegment>,
) -> bool
where
    F: FnMut(&Value, &Value, &mut Vec<PathSegment>) -> bool,
{
    let candidates: Vec<Vec<usize>> = left
        .iter()
        .enumerate()
        .map(|(i, a)| {
            location.push(PathSegment::Index(i));
            let fits = right
                .iter()
                .enumerate()
                .filter(|(_, b)| eq(a, b, location))
                .map(|(j, _)| j)
                .collect();
            location.pop();
            fits
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; right.len()];
    (0..left.len()).all(|i| {
        let mut visited = vec![false; right.len()];
        augment(i, &candidates, &mut owner, &mut visited)
    })
}

/// Find a right slot for left element `i`, moving earlier owners to other
/// slots they also fit.
fn augment(
    i: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    let Some(fits) = candidates.get(i) else {
        return false;
    };
    for &j in fits {
        match visited.get_mut(j) {
            Some(seen) if !*seen => *seen = true,
            _ => continue,
        }
        let free = match owner.get(j).copied().flatten() {
            None => true,
            Some(other) => augment(other, candidates, owner, visited),
        };
        if free {
            if let Some(slot) = owner.get_mut(j) {
                *slot = Some(i);
            }
            return true;
        }
    }
    false
}
