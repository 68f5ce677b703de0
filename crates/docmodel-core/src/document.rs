//! Stored document representation and system-managed field names.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A stored document: an ordered map of top-level fields.
pub type Document = serde_json::Map<String, Value>;

/// Field holding the document id.
pub const ID_FIELD: &str = "_id";
/// Field holding the creation timestamp, set once at first attach.
pub const CREATED_ON_FIELD: &str = "CreatedOn";
/// Field holding the last successful persist timestamp.
pub const MODIFIED_ON_FIELD: &str = "ModifiedOn";
/// Field distinguishing subtypes that share one family collection.
pub const DISCRIMINATOR_FIELD: &str = "_t";

/// Serialize a value into a document.
///
/// Fails if the value does not serialize to a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serde(format!(
            "expected a document, serialized to {}",
            json_kind(&other)
        ))),
    }
}

/// Deserialize a document into a value.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Read the id of a document, if it carries a string id.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
