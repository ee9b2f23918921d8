//! converge-core: document model and manifest codec.
//!
//! This crate holds the types every other part of converge speaks:
//!
//! - [`Value`]: the typed document tree
//! - [`Resource`], [`DesiredResource`], [`ExistingResource`]: identity,
//!   metadata and payload of one object
//! - [`FieldPath`]: path patterns into documents
//! - [`manifest`]: YAML/JSON parsing and rendering
//! - [`Error`] and [`Result`]: typed errors, no panics

pub mod error;
pub mod manifest;
pub mod path;
pub mod resource;
pub mod result;
pub mod value;

pub use error::Error;
pub use path::{FieldPath, PathMatcher, PathSegment, display_location};
pub use resource::{
    DesiredResource, ExistingResource, KindRef, MANAGED_ANNOTATION, Management, ObjectMeta,
    Resource, ResourceKey, SERVER_OWNED_METADATA,
};
pub use result::{OptionExt, Result, ResultExt};
pub use value::{Map, Value, from_json_str};
