//! Entity documents and their identity.

use crate::{CollectionName, DocumentId, FieldName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The schemaless field map of a document. Ordered for deterministic output.
pub type Fields = BTreeMap<FieldName, serde_json::Value>;

/// An entity document. Collection membership is carried separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Identity of the document within its collection
    pub id: DocumentId,
    /// Field values
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    /// Create a new document.
    pub fn new(id: impl Into<DocumentId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}

/// Address of a document: collection plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: CollectionName,
    pub id: DocumentId,
}

impl DocKey {
    pub fn new(collection: impl Into<CollectionName>, id: impl Into<DocumentId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Build a [`Fields`] map from a JSON object. Non-object values yield an
/// empty map.
pub fn fields_from_json(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Fields::new(),
    }
}
