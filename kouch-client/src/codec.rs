//! Envelope codec: domain JSON ⇄ wire JSON.
//!
//! Domain objects use `id`/`revision`; stored documents use `_id`/`_rev`
//! and carry a class discriminator. Encoding and decoding are inverse for
//! every entity whose fields survive a serde round trip.

use crate::config::{KouchConfig, NullFieldPolicy};
use crate::error::{KouchError, KouchResult};
use kouch_types::ClassName;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A JSON object.
pub type JsonMap = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const REV_FIELD: &str = "_rev";
pub const DELETED_FIELD: &str = "_deleted";
pub const DESIGN_PREFIX: &str = "_design/";

const DOMAIN_ID: &str = "id";
const DOMAIN_REV: &str = "revision";

/// Codec settings taken from the client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecOptions {
    pub class_field: String,
    pub null_fields: NullFieldPolicy,
}

impl CodecOptions {
    pub fn from_config(config: &KouchConfig) -> Self {
        Self {
            class_field: config.class_field.clone(),
            null_fields: config.null_fields,
        }
    }
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self::from_config(&KouchConfig::default())
    }
}

fn to_object<T: Serialize>(value: &T) -> KouchResult<JsonMap> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(KouchError::Codec(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Renames `id`/`revision` and applies the null policy. A null revision is
/// always dropped so the key never reaches the server.
fn rename_outgoing(domain: JsonMap, nulls: NullFieldPolicy) -> JsonMap {
    let mut wire = JsonMap::with_capacity(domain.len() + 1);
    for (key, value) in domain {
        match key.as_str() {
            DOMAIN_ID => {
                wire.insert(ID_FIELD.to_string(), value);
            }
            DOMAIN_REV => {
                if !value.is_null() {
                    wire.insert(REV_FIELD.to_string(), value);
                }
            }
            _ if value.is_null() && nulls == NullFieldPolicy::Omit => {}
            _ => {
                wire.insert(key, value);
            }
        }
    }
    wire
}

/// Encodes an entity for storage: renames identity keys and injects the
/// discriminator.
pub fn encode_entity<T: Serialize>(
    entity: &T,
    class_name: &ClassName,
    options: &CodecOptions,
) -> KouchResult<JsonMap> {
    let mut wire = rename_outgoing(to_object(entity)?, options.null_fields);
    if !wire.contains_key(ID_FIELD) {
        return Err(KouchError::Codec(format!("entity has no {DOMAIN_ID:?} field")));
    }
    wire.insert(
        options.class_field.clone(),
        Value::String(class_name.as_str().to_string()),
    );
    Ok(wire)
}

/// Encodes a design document: same renaming, no discriminator, nulls
/// omitted, and the `_design/` prefix added to the id.
pub fn encode_design<T: Serialize>(design: &T) -> KouchResult<JsonMap> {
    let mut wire = rename_outgoing(to_object(design)?, NullFieldPolicy::Omit);
    match wire.get_mut(ID_FIELD) {
        Some(Value::String(id)) if !id.starts_with(DESIGN_PREFIX) => {
            id.insert_str(0, DESIGN_PREFIX);
        }
        Some(Value::String(_)) => {}
        _ => return Err(KouchError::Codec("design document id must be a string".to_string())),
    }
    Ok(wire)
}

/// Inverse renaming. Drops the discriminator and every other underscored
/// system field.
fn rename_incoming(wire: JsonMap, class_field: Option<&str>) -> JsonMap {
    let mut domain = JsonMap::with_capacity(wire.len());
    for (key, value) in wire {
        match key.as_str() {
            ID_FIELD => {
                domain.insert(DOMAIN_ID.to_string(), value);
            }
            REV_FIELD => {
                domain.insert(DOMAIN_REV.to_string(), value);
            }
            k if Some(k) == class_field => {}
            k if k.starts_with('_') => {}
            _ => {
                domain.insert(key, value);
            }
        }
    }
    domain
}

/// Decodes a stored entity document into its domain type.
pub fn decode_entity<T: DeserializeOwned>(wire: JsonMap, class_field: &str) -> KouchResult<T> {
    let domain = rename_incoming(wire, Some(class_field));
    Ok(serde_json::from_value(Value::Object(domain))?)
}

/// Decodes a design document, stripping the `_design/` prefix from its id.
pub fn decode_design<T: DeserializeOwned>(wire: JsonMap) -> KouchResult<T> {
    let mut domain = rename_incoming(wire, None);
    if let Some(Value::String(id)) = domain.get_mut(DOMAIN_ID) {
        if let Some(stripped) = id.strip_prefix(DESIGN_PREFIX) {
            *id = stripped.to_string();
        }
    }
    Ok(serde_json::from_value(Value::Object(domain))?)
}

/// Decodes an arbitrary JSON value (a view row value, say). Objects go
/// through the entity renaming; everything else is deserialized as-is.
pub fn decode_value<T: DeserializeOwned>(value: Value, class_field: &str) -> KouchResult<T> {
    match value {
        Value::Object(map) => decode_entity(map, class_field),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// Splits a raw document into (system fields, entity fields).
///
/// System fields are the underscored keys other than `_id` and `_rev`
/// (`_conflicts`, `_revisions`, `_attachments`, ...). `_id`/`_rev` stay with
/// the entity side because they decode into `id`/`revision`.
pub fn split_system_fields(document: JsonMap) -> (JsonMap, JsonMap) {
    let mut system = JsonMap::new();
    let mut entity = JsonMap::new();
    for (key, value) in document {
        if key.starts_with('_') && key != ID_FIELD && key != REV_FIELD {
            system.insert(key, value);
        } else {
            entity.insert(key, value);
        }
    }
    (system, entity)
}

/// Reads the discriminator of a stored document.
pub fn class_of<'a>(document: &'a JsonMap, class_field: &str) -> Option<&'a str> {
    document.get(class_field).and_then(Value::as_str)
}

/// The `_id` of a stored document, or an empty string.
pub fn id_of(document: &JsonMap) -> &str {
    document.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default()
}

/// True when the document is a deletion tombstone.
pub fn is_tombstone(document: &JsonMap) -> bool {
    document
        .get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
