//! Manifest codec.
//!
//! Parses YAML (multi-document) and JSON manifests into [`Resource`]s and
//! renders them back. A `List` document (`kind: List` or any kind ending in
//! `List` with an `items` sequence) is flattened into its items.

use serde::Deserialize;

use crate::error::Error;
use crate::resource::Resource;
use crate::result::{Result, ResultExt};
use crate::value::Value;

/// Parse every document of a YAML stream. Empty documents are skipped.
///
/// # Errors
///
/// Returns the first syntax error or invalid document.
pub fn parse_yaml(text: &str) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)?;
        collect_resources(value, &mut resources)?;
    }
    Ok(resources)
}

/// Parse a YAML stream, logging and skipping documents that fail to convert.
///
/// A syntax error still stops the stream, since the remaining documents
/// cannot be located reliably.
pub fn parse_yaml_lenient(text: &str) -> Vec<Resource> {
    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let Some(value) = Value::deserialize(document)
            .map_err(Error::from)
            .inspect_error(|e| tracing::warn!(document = index, error = %e, "Manifest stream unreadable"))
            .ok()
        else {
            break;
        };
        let mut batch = Vec::new();
        if collect_resources(value, &mut batch)
            .inspect_error(|e| tracing::warn!(document = index, error = %e, "Skipping invalid document"))
            .is_ok()
        {
            resources.extend(batch);
        }
    }
    resources
}

/// Parse a JSON manifest: a single object, an array of objects, or a list
/// document.
///
/// # Errors
///
/// Returns the parse error or the first invalid document.
pub fn parse_json(text: &str) -> Result<Vec<Resource>> {
    let value: Value = serde_json::from_str(text)?;
    let mut resources = Vec::new();
    match value {
        Value::Sequence(items) => {
            for item in items {
                collect_resources(item, &mut resources)?;
            }
        }
        other => collect_resources(other, &mut resources)?,
    }
    Ok(resources)
}

/// Render resources as a multi-document YAML stream.
///
/// # Errors
///
/// Returns a serialization error if a value cannot be represented.
pub fn render_yaml(resources: &[Resource]) -> Result<String> {
    let mut out = String::new();
    for resource in resources {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&resource.to_value())?);
    }
    Ok(out)
}

/// Render a resource as pretty JSON.
///
/// # Errors
///
/// Returns a serialization error if a value cannot be represented.
pub fn render_json(resource: &Resource) -> Result<String> {
    Ok(serde_json::to_string_pretty(&resource.to_value())?)
}

fn collect_resources(value: Value, out: &mut Vec<Resource>) -> Result<()> {
    if matches!(value, Value::Null) {
        return Ok(());
    }
    if is_list_document(&value) {
        let Value::Map(mut root) = value else {
            return Err(Error::NotAMapping);
        };
        if let Some(Value::Sequence(items)) = root.remove("items") {
            for item in items {
                collect_resources(item, out)?;
            }
        }
        return Ok(());
    }
    out.push(Resource::from_value(value)?);
    Ok(())
}

fn is_list_document(value: &Value) -> bool {
    let is_list_kind = value
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|kind| kind.ends_with("List"));
    is_list_kind && matches!(value.get("items"), Some(Value::Sequence(_)))
}
