//! Typed document values.
//!
//! Manifests are trees of [`Value`]. Maps are keyed by string and ordered by
//! key, so two maps with the same entries compare equal regardless of the
//! order they were written in. Integers and floats are distinct variants:
//! `Int(1) != Float(1.0)`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::{FieldPath, PathSegment};

/// A mapping from field name to value.
pub type Map = BTreeMap<String, Value>;

/// A node in a resource document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Map(Map),
}

impl Value {
    /// An empty map.
    pub const fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Human-readable type name, used in error messages and diffs.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Map(_) => "map",
        }
    }

    /// Whether this value is null, an empty string, an empty sequence or an
    /// empty map.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::Sequence(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) => false,
        }
    }

    pub const fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub const fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a direct child of a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Resolve a concrete path (keys and indices only).
    ///
    /// Wildcard segments never resolve; use [`Value::select`] for patterns.
    pub fn get_path(&self, path: &[PathSegment]) -> Option<&Value> {
        path.iter().try_fold(self, |node, segment| match (segment, node) {
            (PathSegment::Key(key), Self::Map(map)) => map.get(key),
            (PathSegment::Index(i), Self::Sequence(items)) => items.get(*i),
            _ => None,
        })
    }

    /// Collect every value matched by `pattern`, with the concrete path at
    /// which it was found.
    pub fn select(&self, pattern: &FieldPath) -> Vec<(Vec<PathSegment>, &Value)> {
        let mut found = Vec::new();
        let mut current = Vec::new();
        self.select_into(pattern, 0, &mut current, &mut found);
        found
    }

    fn select_into<'a>(
        &'a self,
        pattern: &FieldPath,
        depth: usize,
        current: &mut Vec<PathSegment>,
        found: &mut Vec<(Vec<PathSegment>, &'a Value)>,
    ) {
        let Some(matcher) = pattern.segments().get(depth) else {
            found.push((current.clone(), self));
            return;
        };
        let next = depth.saturating_add(1);
        match self {
            Self::Map(map) => {
                for (key, child) in map {
                    if matcher.matches_key(key) {
                        current.push(PathSegment::Key(key.clone()));
                        child.select_into(pattern, next, current, found);
                        current.pop();
                    }
                }
            }
            Self::Sequence(items) => {
                for (i, child) in items.iter().enumerate() {
                    if matcher.matches_index(i) {
                        current.push(PathSegment::Index(i));
                        child.select_into(pattern, next, current, found);
                        current.pop();
                    }
                }
            }
            _ => {}
        }
    }

    /// Call `f` on every node matched by `pattern`.
    pub fn for_each_matching_mut<F>(&mut self, pattern: &FieldPath, f: &mut F)
    where
        F: FnMut(&mut Value),
    {
        self.visit_at_depth(pattern, 0, f);
    }

    fn visit_at_depth<F>(&mut self, pattern: &FieldPath, depth: usize, f: &mut F)
    where
        F: FnMut(&mut Value),
    {
        let Some(matcher) = pattern.segments().get(depth) else {
            f(self);
            return;
        };
        let next = depth.saturating_add(1);
        match self {
            Self::Map(map) => {
                for (key, child) in map.iter_mut() {
                    if matcher.matches_key(key) {
                        child.visit_at_depth(pattern, next, f);
                    }
                }
            }
            Self::Sequence(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    if matcher.matches_index(i) {
                        child.visit_at_depth(pattern, next, f);
                    }
                }
            }
            _ => {}
        }
    }

    /// Remove every node matched by `pattern`. Returns how many were removed.
    pub fn remove_matching(&mut self, pattern: &FieldPath) -> usize {
        self.remove_at_depth(pattern, 0)
    }

    fn remove_at_depth(&mut self, pattern: &FieldPath, depth: usize) -> usize {
        let segments = pattern.segments();
        let Some(matcher) = segments.get(depth) else {
            return 0;
        };
        let last = depth.saturating_add(1) == segments.len();
        let next = depth.saturating_add(1);
        match self {
            Self::Map(map) => {
                if last {
                    let before = map.len();
                    map.retain(|key, _| !matcher.matches_key(key));
                    before.saturating_sub(map.len())
                } else {
                    map.iter_mut()
                        .filter(|(key, _)| matcher.matches_key(key))
                        .map(|(_, child)| child.remove_at_depth(pattern, next))
                        .sum()
                }
            }
            Self::Sequence(items) => {
                if last {
                    let before = items.len();
                    let mut index = 0usize;
                    items.retain(|_| {
                        let keep = !matcher.matches_index(index);
                        index = index.saturating_add(1);
                        keep
                    });
                    before.saturating_sub(items.len())
                } else {
                    items
                        .iter_mut()
                        .enumerate()
                        .filter(|(i, _)| matcher.matches_index(*i))
                        .map(|(_, child)| child.remove_at_depth(pattern, next))
                        .sum()
                }
            }
            _ => 0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Sequence(_) | Self::Map(_) => {
                let rendered = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{rendered}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Sequence(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Map(map)
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::Map(iter.into_iter().collect())
    }
}

/// Build a [`Value`] from JSON text written inline. Intended for tests and
/// producers that embed small literals.
///
/// # Errors
///
/// Returns the JSON parse error when `text` is not valid JSON.
pub fn from_json_str(text: &str) -> crate::Result<Value> {
    Ok(serde_json::from_str(text)?)
}
