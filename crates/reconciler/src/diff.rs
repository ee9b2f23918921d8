//! Human-readable change descriptions.
//!
//! The diff is observational only: it explains why an update is about to be
//! issued but never decides whether one is needed. That is the equality
//! registry's job.

use std::fmt;

use converge_core::{
    DesiredResource, ExistingResource, Map, PathSegment, ResourceKey, Value, display_location,
};
use itertools::Itertools;

use crate::equality::ComparisonProfile;

/// Kind of change at one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Set by the desired document, absent on the live object.
    Added,
    /// Present on the live object, absent from the desired document.
    Removed,
    Modified,
}

impl ChangeKind {
    const fn marker(self) -> char {
        match self {
            Self::Added => '+',
            Self::Removed => '-',
            Self::Modified => '~',
        }
    }
}

/// One difference between desired and existing.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub location: Vec<PathSegment>,
    pub kind: ChangeKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = display_location(&self.location);
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => {
                write!(f, "{} {path}: {before} -> {after}", self.kind.marker())
            }
            (None, Some(value)) | (Some(value), None) => {
                write!(f, "{} {path}: {value}", self.kind.marker())
            }
            (None, None) => write!(f, "{} {path}", self.kind.marker()),
        }
    }
}

/// All differences found for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub key: ResourceKey,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// One line per change, without the header.
    pub fn render(&self) -> String {
        self.changes.iter().map(ToString::to_string).join("\n")
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} changes)", self.key, self.changes.len())?;
        for change in &self.changes {
            writeln!(f, "  {change}")?;
        }
        Ok(())
    }
}

/// Describe what an update of `existing` to `desired` would change.
///
/// Metadata follows the subset rule: only labels and annotations the desired
/// sets are reported. The payload is diffed in full after both sides are
/// sanitized by `profile`.
pub fn explain(
    desired: &DesiredResource,
    existing: &ExistingResource,
    profile: &ComparisonProfile,
) -> ChangeSet {
    let mut changes = Vec::new();
    if profile.compare_labels {
        metadata_changes(
            "labels",
            desired.metadata().labels.iter(),
            |k| existing.metadata().labels.get(k),
            &mut changes,
        );
    }
    if profile.compare_annotations {
        metadata_changes(
            "annotations",
            desired
                .metadata()
                .annotations
                .iter()
                .filter(|(k, _)| !profile.is_annotation_ignored(k)),
            |k| existing.metadata().annotations.get(k),
            &mut changes,
        );
    }
    let mut location = Vec::new();
    diff_values(
        Some(&profile.sanitize(desired.payload())),
        Some(&profile.sanitize(existing.payload())),
        &mut location,
        &mut changes,
    );
    ChangeSet {
        key: desired.key().clone(),
        changes,
    }
}

fn metadata_changes<'a, I, F>(section: &str, wanted: I, live: F, changes: &mut Vec<Change>)
where
    I: Iterator<Item = (&'a String, &'a String)>,
    F: Fn(&str) -> Option<&'a String>,
{
    for (key, value) in wanted {
        let location = vec![
            PathSegment::Key("metadata".into()),
            PathSegment::Key(section.into()),
            PathSegment::Key(key.clone()),
        ];
        match live(key) {
            Some(current) if current == value => {}
            Some(current) => changes.push(Change {
                location,
                kind: ChangeKind::Modified,
                before: Some(Value::from(current.as_str())),
                after: Some(Value::from(value.as_str())),
            }),
            None => changes.push(Change {
                location,
                kind: ChangeKind::Added,
                before: None,
                after: Some(Value::from(value.as_str())),
            }),
        }
    }
}

fn diff_values(
    desired: Option<&Value>,
    existing: Option<&Value>,
    location: &mut Vec<PathSegment>,
    changes: &mut Vec<Change>,
) {
    match (desired, existing) {
        (Some(Value::Map(want)), Some(Value::Map(have))) => diff_maps(want, have, location, changes),
        (Some(Value::Sequence(want)), Some(Value::Sequence(have))) => {
            for i in 0..want.len().max(have.len()) {
                location.push(PathSegment::Index(i));
                diff_values(want.get(i), have.get(i), location, changes);
                location.pop();
            }
        }
        (Some(want), Some(have)) if want == have => {}
        (Some(want), Some(have)) => changes.push(Change {
            location: location.clone(),
            kind: ChangeKind::Modified,
            before: Some(have.clone()),
            after: Some(want.clone()),
        }),
        (Some(want), None) => changes.push(Change {
            location: location.clone(),
            kind: ChangeKind::Added,
            before: None,
            after: Some(want.clone()),
        }),
        (None, Some(have)) => changes.push(Change {
            location: location.clone(),
            kind: ChangeKind::Removed,
            before: Some(have.clone()),
            after: None,
        }),
        (None, None) => {}
    }
}

fn diff_maps(want: &Map, have: &Map, location: &mut Vec<PathSegment>, changes: &mut Vec<Change>) {
    for key in want.keys().merge(have.keys()).dedup() {
        location.push(PathSegment::Key(key.clone()));
        diff_values(want.get(key), have.get(key), location, changes);
        location.pop();
    }
}
