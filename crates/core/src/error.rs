//! Core error types for document handling.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

use crate::resource::ResourceKey;

/// Core error type for document and collection operations.
#[derive(Debug, Error)]
pub enum Error {
    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    // Document shape errors
    #[error("document is missing required field '{field}'")]
    MissingField { field: String },

    #[error("field '{field}' has the wrong type: expected {expected}")]
    InvalidField { field: String, expected: String },

    #[error("document root must be a mapping")]
    NotAMapping,

    // Collection errors
    #[error("resource {key} is already present in the collection")]
    DuplicateResource { key: ResourceKey },

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a YAML parse error.
    pub fn yaml_parse_failed(reason: impl Into<String>) -> Self {
        Self::YamlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Create a duplicate resource error.
    pub const fn duplicate_resource(key: ResourceKey) -> Self {
        Self::DuplicateResource { key }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::json_parse_failed(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::yaml_parse_failed(err.to_string())
    }
}
