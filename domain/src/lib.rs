//! Domain library for docfix.
//!
//! Holds the document types, store ports (traits), error definitions, and the
//! registries built on top of them. Filesystem discovery lives in the
//! `fs-loader` adapter; keep globbing and other IO concerns out of this crate.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::driver::ConnectionUri;

pub use crate::schema::{FieldOptions, FieldSpec, FieldType, Schema, SchemaDefinition, SchemaOptions};

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Field holding the primary key of every document.
pub const ID_FIELD: &str = "_id";

/// Render an `_id` value as the string key used by stores and fixture trees.
pub fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// True when every field of `filter` is present in `doc` with an equal value.
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(field, expected)| doc.get(field) == Some(expected))
}

/// A named model bound to a logical database, as declared in a schema file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub model_name: String,
    pub db_name: String,
    pub schema: SchemaDefinition,
}

impl ModelDescriptor {
    pub fn new<N: Into<String>, D: Into<String>>(
        model_name: N,
        db_name: D,
        schema: SchemaDefinition,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            db_name: db_name.into(),
            schema,
        }
    }
}

/// A fixture as loaded from disk, before it is inserted anywhere.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDoc {
    pub name: String,
    pub doc_contents: Document,
}

impl FixtureDoc {
    /// The fixture id, taken from `docContents._id`.
    pub fn id(&self) -> Result<String, CoreError> {
        self.doc_contents
            .get(ID_FIELD)
            .and_then(id_key)
            .ok_or_else(|| {
                CoreError::validation(
                    format!("fixture '{}' has no usable _id", self.name),
                    json!({ "name": self.name }),
                )
            })
    }
}

/// A fixture together with the database and collection it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct FixtureSource {
    pub db_name: String,
    pub collection_name: String,
    pub fixture: FixtureDoc,
}

/// Supplies descriptors to a registry. Filesystem globbing implements this in
/// `fs-loader`; tests hand in plain vectors.
pub trait DescriptorProvider<T>: Send + Sync {
    fn descriptors(&self) -> Result<Vec<T>, CoreError>;
}

impl<T: Clone + Send + Sync> DescriptorProvider<T> for Vec<T> {
    fn descriptors(&self) -> Result<Vec<T>, CoreError> {
        Ok(self.clone())
    }
}

/// Opens databases for connection URIs of a single scheme.
pub trait Driver: Send + Sync {
    fn connect(&self, uri: &ConnectionUri) -> Result<Arc<dyn Database>, CoreError>;
}

/// A logical database reached through a driver.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;
    /// Get (creating on first use) the named collection.
    fn collection(&self, name: &str) -> Result<Arc<dyn CollectionStore>, CoreError>;
    fn collection_names(&self) -> Result<Vec<String>, CoreError>;
}

/// Storage port for the documents of one collection.
pub trait CollectionStore: Send + Sync {
    /// Insert a document that already carries `_id`. Duplicate keys are a
    /// validation error.
    fn insert_one(&self, doc: Document) -> Result<(), CoreError>;
    fn find_by_id(&self, id: &str) -> Result<Option<Document>, CoreError>;
    /// Documents matching every field of `filter`, in insertion order.
    fn find(&self, filter: &Document) -> Result<Vec<Document>, CoreError>;
    fn delete_by_id(&self, id: &str) -> Result<bool, CoreError>;
    fn count(&self) -> Result<usize, CoreError>;
    fn create_index(&self, field: &str, unique: bool) -> Result<(), CoreError>;
}

/// Core errors. Validation and not-found errors carry structured context so
/// callers can inspect the offending descriptors, not just a message.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {message}")]
    Validation { message: String, context: Value },
    #[error("not found: {message}")]
    NotFound { message: String, context: Value },
    #[error("{message}: {source}")]
    Connection {
        message: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("repository error: {0}")]
    Repository(String),
}

impl CoreError {
    pub fn validation<M: Into<String>>(message: M, context: Value) -> Self {
        CoreError::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn not_found<M: Into<String>>(message: M, context: Value) -> Self {
        CoreError::NotFound {
            message: message.into(),
            context,
        }
    }

    pub fn connection<M, E>(message: M, source: E) -> Self
    where
        M: Into<String>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        CoreError::Connection {
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, CoreError::Connection { .. })
    }

    /// Structured context of validation and not-found errors.
    pub fn context(&self) -> Option<&Value> {
        match self {
            CoreError::Validation { context, .. } | CoreError::NotFound { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }
}

pub(crate) fn poisoned(what: &str) -> CoreError {
    CoreError::Repository(format!("{what} lock poisoned"))
}

pub mod adapters;
pub mod config;
pub mod driver;
pub mod ephemeral;
pub mod fixtures;
pub mod model;
pub mod models;
pub mod pool;
pub mod schema;

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn id_key_accepts_strings_and_numbers() {
        assert_eq!(id_key(&json!("abc")).as_deref(), Some("abc"));
        assert_eq!(id_key(&json!(42)).as_deref(), Some("42"));
        assert_eq!(id_key(&json!("")), None);
        assert_eq!(id_key(&json!(null)), None);
        assert_eq!(id_key(&json!({ "a": 1 })), None);
    }

    #[test]
    fn filter_requires_every_field() {
        let d = doc(json!({ "_id": "1", "name": "a", "n": 2 }));
        assert!(matches_filter(&d, &Document::new()));
        assert!(matches_filter(&d, &doc(json!({ "name": "a" }))));
        assert!(!matches_filter(&d, &doc(json!({ "name": "a", "n": 3 }))));
        assert!(!matches_filter(&d, &doc(json!({ "missing": null }))));
    }

    #[test]
    fn fixture_doc_deserializes_camel_case() {
        let fixture: FixtureDoc = serde_json::from_value(json!({
            "name": "0_test",
            "docContents": { "_id": "A", "name": "first" }
        }))
        .unwrap();
        assert_eq!(fixture.id().unwrap(), "A");
        assert_eq!(fixture.doc_contents["name"], json!("first"));
    }

    #[test]
    fn fixture_without_id_is_rejected() {
        let fixture = FixtureDoc {
            name: "nameless".into(),
            doc_contents: doc(json!({ "name": "x" })),
        };
        let err = fixture.id().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.context().unwrap()["name"], json!("nameless"));
    }

    #[test]
    fn error_kinds_are_distinguishable() {
        let v = CoreError::validation("dup", json!({ "id": "A" }));
        let n = CoreError::not_found("missing", json!({ "ids": ["B"] }));
        let c = CoreError::connection("open failed", "refused");
        assert!(v.is_validation() && !v.is_not_found());
        assert!(n.is_not_found() && !n.is_validation());
        assert!(c.is_connection() && c.context().is_none());
        assert_eq!(c.to_string(), "open failed: refused");
        assert_eq!(n.context().unwrap()["ids"], json!(["B"]));
    }
}
