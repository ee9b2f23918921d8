//! Desired resource collections.

use std::collections::{HashMap, HashSet};

use converge_core::{
    DesiredResource, Error, MANAGED_ANNOTATION, Management, Result, ResourceKey, manifest,
};

/// An ordered, append-only set of desired resources. No two entries share a
/// key; insertion order is dependency order.
#[derive(Debug, Clone, Default)]
pub struct ResourceCollection {
    entries: Vec<DesiredResource>,
    index: HashMap<ResourceKey, usize>,
}

impl ResourceCollection {
    /// Create a new empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from a YAML manifest stream, in document order.
    ///
    /// # Errors
    ///
    /// Returns a parse error, an invalid document, or `DuplicateResource`.
    pub fn from_manifests(text: &str) -> Result<Self> {
        let mut collection = Self::new();
        for resource in manifest::parse_yaml(text)? {
            collection.add(resource)?;
        }
        Ok(collection)
    }

    /// Append a resource, stamping `converge.io/managed: owned` when the
    /// producer did not choose a management mode.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the key is already present; the
    /// collection is unchanged.
    pub fn add(&mut self, resource: impl Into<DesiredResource>) -> Result<()> {
        let desired = stamp(resource.into());
        if self.index.contains_key(desired.key()) {
            return Err(Error::duplicate_resource(desired.key().clone()));
        }
        self.index.insert(desired.key().clone(), self.entries.len());
        self.entries.push(desired);
        Ok(())
    }

    /// Append every entry of `other`, keeping both orders.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` without applying anything if a key of
    /// `other` is already present.
    pub fn merge(&mut self, other: Self) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(clash) = other
            .keys()
            .find(|key| self.index.contains_key(*key) || !seen.insert(*key))
        {
            return Err(Error::duplicate_resource(clash.clone()));
        }
        for desired in other.entries {
            self.index.insert(desired.key().clone(), self.entries.len());
            self.entries.push(desired);
        }
        Ok(())
    }

    /// Entries in insertion order.
    pub fn list(&self) -> &[DesiredResource] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DesiredResource> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.entries.iter().map(DesiredResource::key)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&DesiredResource> {
        self.index.get(key).and_then(|&i| self.entries.get(i))
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn stamp(desired: DesiredResource) -> DesiredResource {
    if desired.metadata().annotations.contains_key(MANAGED_ANNOTATION) {
        desired
    } else {
        desired.with_management(Management::Owned)
    }
}

impl<'a> IntoIterator for &'a ResourceCollection {
    type Item = &'a DesiredResource;
    type IntoIter = std::slice::Iter<'a, DesiredResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
