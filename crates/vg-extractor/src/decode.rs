//! Validating decode of parsed model output
//!
//! Turns the loosely shaped JSON object returned by the recovery parser
//! into typed entities and relationships. Items missing a required field
//! are dropped one by one and counted; a payload whose top level is not
//! usable is an error so the caller can retry the chunk.

use serde_json::Value;
use vg_core::{
    clean_entity_name, ExtractedEntity, ExtractedRelationship, ExtractionResult, Properties,
    Result, SourceRef, VgError,
};

use crate::parser::ParsedResponse;

/// Default type for entities the model left untyped
pub const DEFAULT_ENTITY_TYPE: &str = "unknown";

/// Default type for relationships the model left untyped
pub const DEFAULT_RELATIONSHIP_TYPE: &str = "relates_to";

/// Decode a parsed response into an extraction result
pub fn decode(parsed: &ParsedResponse) -> Result<ExtractionResult> {
    let object = parsed
        .value
        .as_object()
        .ok_or_else(|| VgError::DecodeError("top-level value is not an object".to_string()))?;

    let mut result = ExtractionResult {
        strategy: parsed.strategy,
        ..Default::default()
    };

    for item in items(object.get("entities"), "entities")? {
        match decode_entity(item) {
            Some(entity) => result.entities.push(entity),
            None => result.skipped_items += 1,
        }
    }

    for item in items(object.get("relationships"), "relationships")? {
        match decode_relationship(item) {
            Some(relationship) => result.relationships.push(relationship),
            None => result.skipped_items += 1,
        }
    }

    if result.skipped_items > 0 {
        tracing::debug!(
            skipped = result.skipped_items,
            "dropped extraction items missing required fields"
        );
    }

    Ok(result)
}

fn items<'a>(value: Option<&'a Value>, key: &str) -> Result<&'a [Value]> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => Err(VgError::DecodeError(format!(
            "`{key}` must be an array, got {}",
            kind(other)
        ))),
    }
}

fn decode_entity(item: &Value) -> Option<ExtractedEntity> {
    let name = required_name(item, "name")?;
    let entity_type = type_or(item, DEFAULT_ENTITY_TYPE);
    let (properties, sources) = split_properties(item);

    Some(ExtractedEntity {
        name,
        entity_type,
        properties,
        sources,
    })
}

fn decode_relationship(item: &Value) -> Option<ExtractedRelationship> {
    let source = required_name(item, "source")?;
    let target = required_name(item, "target")?;
    let relationship_type = type_or(item, DEFAULT_RELATIONSHIP_TYPE);
    let (properties, sources) = split_properties(item);

    Some(ExtractedRelationship {
        source,
        target,
        relationship_type,
        properties,
        sources,
    })
}

fn required_name(item: &Value, key: &str) -> Option<String> {
    let name = clean_entity_name(item.get(key)?.as_str()?);
    (!name.is_empty()).then_some(name)
}

fn type_or(item: &Value, default: &str) -> String {
    item.get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Split the model's `properties` object into plain properties and any
/// provenance records it already carried
fn split_properties(item: &Value) -> (Properties, Vec<SourceRef>) {
    let mut properties = Properties::new();
    let mut sources = Vec::new();

    let Some(object) = item.get("properties").and_then(Value::as_object) else {
        return (properties, sources);
    };

    for (key, value) in object {
        if key == "sources" {
            if let Some(list) = value.as_array() {
                sources.extend(
                    list.iter()
                        .filter_map(|s| serde_json::from_value::<SourceRef>(s.clone()).ok()),
                );
            }
            continue;
        }
        if !value.is_null() {
            properties.insert(key.clone(), value.clone());
        }
    }

    (properties, sources)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
