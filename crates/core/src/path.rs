//! Field paths into documents.
//!
//! A [`FieldPath`] is a pattern like `spec.template.spec.containers[].env`,
//! where `[]` matches any sequence index and `*` matches any map key. Concrete
//! locations found while walking a document are lists of [`PathSegment`].

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One step of a concrete location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// One step of a path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathMatcher {
    Key(String),
    AnyIndex,
    AnyKey,
}

impl PathMatcher {
    pub fn matches_key(&self, key: &str) -> bool {
        match self {
            Self::Key(expected) => expected == key,
            Self::AnyKey => true,
            Self::AnyIndex => false,
        }
    }

    pub const fn matches_index(&self, _index: usize) -> bool {
        matches!(self, Self::AnyIndex)
    }

    pub fn matches(&self, segment: &PathSegment) -> bool {
        match segment {
            PathSegment::Key(key) => self.matches_key(key),
            PathSegment::Index(i) => self.matches_index(*i),
        }
    }
}

/// A path pattern into a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath {
    segments: Vec<PathMatcher>,
}

impl FieldPath {
    /// Parse a dotted pattern. Empty input is the root path.
    ///
    /// `a.b[].c` yields `Key(a), Key(b), AnyIndex, Key(c)`; a bare `*` segment
    /// matches any key.
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        for part in pattern.split('.').filter(|p| !p.is_empty()) {
            let mut name = part;
            let mut any_index = 0usize;
            while let Some(stripped) = name.strip_suffix("[]") {
                name = stripped;
                any_index = any_index.saturating_add(1);
            }
            match name {
                "" => {}
                "*" => segments.push(PathMatcher::AnyKey),
                key => segments.push(PathMatcher::Key(key.to_string())),
            }
            segments.extend(std::iter::repeat_n(PathMatcher::AnyIndex, any_index));
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[PathMatcher] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether a concrete location is matched by this pattern exactly.
    pub fn matches(&self, location: &[PathSegment]) -> bool {
        self.segments.len() == location.len()
            && self
                .segments
                .iter()
                .zip(location)
                .all(|(matcher, segment)| matcher.matches(segment))
    }

    /// Whether this pattern matches a prefix of `location`, i.e. `location`
    /// lies inside a matched subtree.
    pub fn contains(&self, location: &[PathSegment]) -> bool {
        location.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(location)
                .all(|(matcher, segment)| matcher.matches(segment))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for matcher in &self.segments {
            match matcher {
                PathMatcher::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                PathMatcher::AnyKey => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push('*');
                }
                PathMatcher::AnyIndex => out.push_str("[]"),
            }
        }
        write!(f, "{out}")
    }
}

impl From<&str> for FieldPath {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Render a concrete location as `spec.containers[0].image`.
pub fn display_location(location: &[PathSegment]) -> String {
    if location.is_empty() {
        return "<root>".to_string();
    }
    location
        .iter()
        .enumerate()
        .map(|(i, segment)| match segment {
            PathSegment::Key(key) if i == 0 => key.clone(),
            PathSegment::Key(key) => format!(".{key}"),
            PathSegment::Index(index) => format!("[{index}]"),
        })
        .join("")
}
