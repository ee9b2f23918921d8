//! Resource identity, metadata, and desired/existing documents.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;
use crate::value::{Map, Value};

/// Annotation recording how the engine manages an object.
pub const MANAGED_ANNOTATION: &str = "converge.io/managed";

/// Metadata fields only the server writes. They are parsed into dedicated
/// [`ObjectMeta`] fields and never take part in equality.
pub const SERVER_OWNED_METADATA: &[&str] = &[
    "resourceVersion",
    "generation",
    "uid",
    "selfLink",
    "creationTimestamp",
    "deletionTimestamp",
    "managedFields",
];

/// The (apiVersion, kind) pair naming a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindRef {
    pub api_version: String,
    pub kind: String,
}

impl KindRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Unique identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// Key for a namespaced object.
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    pub fn kind_ref(&self) -> KindRef {
        KindRef::new(self.api_version.clone(), self.kind.clone())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// How the engine treats an object it manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Management {
    /// Created, updated and pruned by the engine.
    Owned,
    /// Created and updated, never pruned.
    Protected,
    /// Created when missing, never updated.
    NoUpdate,
}

impl Management {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::Protected => "protected",
            Self::NoUpdate => "no-update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "owned" => Some(Self::Owned),
            "protected" => Some(Self::Protected),
            "no-update" => Some(Self::NoUpdate),
            _ => None,
        }
    }
}

/// Object metadata, split into authored and server-owned parts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectMeta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<Value>,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    pub uid: Option<String>,
    pub self_link: Option<String>,
    pub creation_timestamp: Option<String>,
    pub deletion_timestamp: Option<String>,
    pub managed_fields: Option<Value>,
    /// Any other metadata field (finalizers, generateName, ...).
    pub extra: Map,
}

impl ObjectMeta {
    fn from_map(mut map: Map) -> Result<Self> {
        let labels = take_string_map(&mut map, "labels")?;
        let annotations = take_string_map(&mut map, "annotations")?;
        let owner_references = match map.remove("ownerReferences") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(items)) => items,
            Some(_) => {
                return Err(Error::invalid_field(
                    "metadata.ownerReferences",
                    "sequence",
                ));
            }
        };
        let generation = match map.remove("generation") {
            None | Some(Value::Null) => None,
            Some(Value::Int(g)) => Some(g),
            Some(_) => return Err(Error::invalid_field("metadata.generation", "int")),
        };
        Ok(Self {
            labels,
            annotations,
            owner_references,
            resource_version: take_string(&mut map, "resourceVersion")?,
            generation,
            uid: take_string(&mut map, "uid")?,
            self_link: take_string(&mut map, "selfLink")?,
            creation_timestamp: take_string(&mut map, "creationTimestamp")?,
            deletion_timestamp: take_string(&mut map, "deletionTimestamp")?,
            managed_fields: map.remove("managedFields"),
            extra: map,
        })
    }

    fn into_map(self, key: &ResourceKey) -> Map {
        let mut map = self.extra;
        map.insert("name".into(), Value::from(key.name.clone()));
        if let Some(ns) = &key.namespace {
            map.insert("namespace".into(), Value::from(ns.clone()));
        }
        if !self.labels.is_empty() {
            map.insert("labels".into(), string_map_value(self.labels));
        }
        if !self.annotations.is_empty() {
            map.insert("annotations".into(), string_map_value(self.annotations));
        }
        if !self.owner_references.is_empty() {
            map.insert(
                "ownerReferences".into(),
                Value::Sequence(self.owner_references),
            );
        }
        let optional = [
            ("resourceVersion", self.resource_version),
            ("uid", self.uid),
            ("selfLink", self.self_link),
            ("creationTimestamp", self.creation_timestamp),
            ("deletionTimestamp", self.deletion_timestamp),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                map.insert(field.into(), Value::from(value));
            }
        }
        if let Some(generation) = self.generation {
            map.insert("generation".into(), Value::Int(generation));
        }
        if let Some(managed) = self.managed_fields {
            map.insert("managedFields".into(), managed);
        }
        map
    }

    /// Drop every server-owned field, keeping only what a producer authors.
    pub fn authored(&self) -> Self {
        Self {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            owner_references: self.owner_references.clone(),
            extra: self.extra.clone(),
            ..Self::default()
        }
    }
}

fn take_string(map: &mut Map, field: &str) -> Result<Option<String>> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(Error::invalid_field(format!("metadata.{field}"), "string")),
    }
}

fn take_string_map(map: &mut Map, field: &str) -> Result<BTreeMap<String, String>> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Map(entries)) => entries
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                _ => Err(Error::invalid_field(
                    format!("metadata.{field}.{k}"),
                    "string",
                )),
            })
            .collect(),
        Some(_) => Err(Error::invalid_field(format!("metadata.{field}"), "map")),
    }
}

fn string_map_value(entries: BTreeMap<String, String>) -> Value {
    entries
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

/// A resource document: identity, metadata and payload.
///
/// The payload is every top-level field other than `apiVersion`, `kind` and
/// `metadata` (for example `spec`, `data`, `rules`, `status`). It is always a
/// map.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    key: ResourceKey,
    metadata: ObjectMeta,
    payload: Value,
}

impl Resource {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            metadata: ObjectMeta::default(),
            payload: Value::empty_map(),
        }
    }

    /// Build a resource from a parsed document.
    ///
    /// # Errors
    ///
    /// Returns an error when the root is not a map, or `apiVersion`, `kind`
    /// or `metadata.name` is missing or mistyped.
    pub fn from_value(document: Value) -> Result<Self> {
        let Value::Map(mut root) = document else {
            return Err(Error::NotAMapping);
        };
        let api_version = required_string(&mut root, "apiVersion")?;
        let kind = required_string(&mut root, "kind")?;
        let mut metadata = match root.remove("metadata") {
            Some(Value::Map(map)) => map,
            Some(_) => return Err(Error::invalid_field("metadata", "map")),
            None => return Err(Error::missing_field("metadata")),
        };
        let name = match metadata.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            Some(Value::String(_)) | None => return Err(Error::missing_field("metadata.name")),
            Some(_) => return Err(Error::invalid_field("metadata.name", "string")),
        };
        let namespace = match metadata.remove("namespace") {
            None | Some(Value::Null) => None,
            Some(Value::String(ns)) if ns.is_empty() => None,
            Some(Value::String(ns)) => Some(ns),
            Some(_) => return Err(Error::invalid_field("metadata.namespace", "string")),
        };
        Ok(Self {
            key: ResourceKey {
                api_version,
                kind,
                namespace,
                name,
            },
            metadata: ObjectMeta::from_map(metadata)?,
            payload: Value::Map(root),
        })
    }

    /// Render the full document.
    pub fn to_value(&self) -> Value {
        let mut root = self.payload.as_map().cloned().unwrap_or_default();
        root.insert("apiVersion".into(), Value::from(self.key.api_version.clone()));
        root.insert("kind".into(), Value::from(self.key.kind.clone()));
        root.insert(
            "metadata".into(),
            Value::Map(self.metadata.clone().into_map(&self.key)),
        );
        Value::Map(root)
    }

    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub const fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    pub const fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Look up a top-level payload field such as `spec`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Set a top-level payload field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        if let Some(map) = self.payload.as_map_mut() {
            map.insert(name.into(), value);
        }
        self
    }

    /// Mutable access to a top-level payload field.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.payload.as_map_mut().and_then(|map| map.get_mut(name))
    }

    /// Replace the payload.
    ///
    /// # Errors
    ///
    /// Returns `NotAMapping` when `payload` is not a map.
    pub fn with_payload(mut self, payload: Value) -> Result<Self> {
        if !matches!(payload, Value::Map(_)) {
            return Err(Error::NotAMapping);
        }
        self.payload = payload;
        Ok(self)
    }

    pub fn management(&self) -> Option<Management> {
        self.metadata
            .annotations
            .get(MANAGED_ANNOTATION)
            .and_then(|raw| Management::parse(raw))
    }

    /// Managed by this engine and not owned by another object.
    pub fn is_ours(&self) -> bool {
        self.metadata.annotations.contains_key(MANAGED_ANNOTATION)
            && self.metadata.owner_references.is_empty()
    }

    pub fn is_protected(&self) -> bool {
        self.management() == Some(Management::Protected)
    }

    pub fn is_immutable(&self) -> bool {
        self.management() == Some(Management::NoUpdate)
    }

    pub const fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn required_string(root: &mut Map, field: &str) -> Result<String> {
    match root.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) | None => Err(Error::missing_field(field)),
        Some(_) => Err(Error::invalid_field(field, "string")),
    }
}

/// A producer-authored target document for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResource(Resource);

impl DesiredResource {
    /// Wrap a resource as desired state. Server-owned metadata a producer may
    /// have copied in is dropped.
    pub fn new(resource: Resource) -> Self {
        let Resource {
            key,
            metadata,
            payload,
        } = resource;
        Self(Resource {
            key,
            metadata: metadata.authored(),
            payload,
        })
    }

    /// Parse a desired document.
    ///
    /// # Errors
    ///
    /// See [`Resource::from_value`].
    pub fn from_value(document: Value) -> Result<Self> {
        Resource::from_value(document).map(Self::new)
    }

    /// Set the management mode annotation.
    #[must_use]
    pub fn with_management(mut self, management: Management) -> Self {
        self.0
            .metadata
            .annotations
            .insert(MANAGED_ANNOTATION.to_string(), management.as_str().to_string());
        self
    }

    pub const fn key(&self) -> &ResourceKey {
        self.0.key()
    }

    pub const fn metadata(&self) -> &ObjectMeta {
        self.0.metadata()
    }

    pub const fn payload(&self) -> &Value {
        self.0.payload()
    }

    pub const fn as_resource(&self) -> &Resource {
        &self.0
    }

    pub fn into_resource(self) -> Resource {
        self.0
    }
}

impl From<Resource> for DesiredResource {
    fn from(resource: Resource) -> Self {
        Self::new(resource)
    }
}

/// A live object fetched from the cluster during one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingResource(Resource);

impl ExistingResource {
    pub const fn new(resource: Resource) -> Self {
        Self(resource)
    }

    /// Parse a live document.
    ///
    /// # Errors
    ///
    /// See [`Resource::from_value`].
    pub fn from_value(document: Value) -> Result<Self> {
        Resource::from_value(document).map(Self)
    }

    /// The concurrency token sent back on update.
    pub fn resource_version(&self) -> Option<&str> {
        self.0.metadata.resource_version.as_deref()
    }

    pub const fn key(&self) -> &ResourceKey {
        self.0.key()
    }

    pub const fn metadata(&self) -> &ObjectMeta {
        self.0.metadata()
    }

    pub const fn payload(&self) -> &Value {
        self.0.payload()
    }

    pub const fn as_resource(&self) -> &Resource {
        &self.0
    }

    pub fn into_resource(self) -> Resource {
        self.0
    }
}
