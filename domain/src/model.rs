use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::{id_key, CollectionStore, CoreError, Document, Schema, ID_FIELD};

/// A schema bound to a live collection store.
///
/// Cloning is cheap; clones share the schema and the store.
#[derive(Clone)]
pub struct Model {
    name: String,
    schema: Arc<Schema>,
    store: Arc<dyn CollectionStore>,
}

impl Model {
    pub fn new<N: Into<String>>(name: N, schema: Schema, store: Arc<dyn CollectionStore>) -> Self {
        Self {
            name: name.into(),
            schema: Arc::new(schema),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_name(&self) -> &str {
        self.schema.collection()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Build every index the schema declares.
    pub fn create_indexes(&self) -> Result<(), CoreError> {
        for (field, unique) in self.schema.indexes() {
            self.store.create_index(&field, unique)?;
        }
        Ok(())
    }

    /// Cast and insert a document, returning the live record.
    pub fn create(&self, doc: Document) -> Result<Record, CoreError> {
        let doc = self.schema.cast(doc)?;
        self.store.insert_one(doc.clone())?;
        Ok(Record {
            model: self.clone(),
            doc,
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Record>, CoreError> {
        Ok(self.store.find_by_id(id)?.map(|doc| Record {
            model: self.clone(),
            doc,
        }))
    }

    /// Plain stored document, without a record wrapper.
    pub fn find_by_id_lean(&self, id: &str) -> Result<Option<Document>, CoreError> {
        self.store.find_by_id(id)
    }

    pub fn find(&self, filter: &Document) -> Result<Vec<Record>, CoreError> {
        Ok(self
            .store
            .find(filter)?
            .into_iter()
            .map(|doc| Record {
                model: self.clone(),
                doc,
            })
            .collect())
    }

    pub fn delete_by_id(&self, id: &str) -> Result<bool, CoreError> {
        self.store.delete_by_id(id)
    }

    pub fn count_documents(&self) -> Result<usize, CoreError> {
        self.store.count()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("collection", &self.collection_name())
            .finish()
    }
}

/// A persisted document together with the model it came from.
#[derive(Clone, Debug)]
pub struct Record {
    model: Model,
    doc: Document,
}

impl Record {
    pub fn id(&self) -> String {
        self.doc.get(ID_FIELD).and_then(id_key).unwrap_or_default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.doc.get(field)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Plain-object snapshot of the current state.
    pub fn to_object(&self) -> Document {
        self.doc.clone()
    }

    /// Re-read the record from the store.
    pub fn reload(&mut self) -> Result<(), CoreError> {
        let id = self.id();
        match self.model.store.find_by_id(&id)? {
            Some(doc) => {
                self.doc = doc;
                Ok(())
            }
            None => Err(CoreError::not_found(
                format!("document {} no longer exists", id),
                json!({ "id": id, "collection": self.model.collection_name() }),
            )),
        }
    }

    pub fn delete(self) -> Result<bool, CoreError> {
        self.model.store.delete_by_id(&self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_server::MemoryCollection;
    use crate::{FieldOptions, FieldType, SchemaDefinition, SchemaOptions};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn model() -> Model {
        let def = SchemaDefinition::new()
            .field("name", FieldOptions::new(FieldType::String).required())
            .field("email", FieldOptions::new(FieldType::String).unique());
        let schema = Schema::new(&def, SchemaOptions::collection("people")).unwrap();
        Model::new("Person", schema, Arc::new(MemoryCollection::detached("people")))
    }

    #[test]
    fn create_then_find_lean_and_full() {
        let m = model();
        let created = m.create(doc(json!({ "_id": "p1", "name": "Ada" }))).unwrap();
        assert_eq!(created.id(), "p1");

        let lean = m.find_by_id_lean("p1").unwrap().unwrap();
        let full = m.find_by_id("p1").unwrap().unwrap();
        assert_eq!(full.to_object(), lean);
        assert_eq!(full.get("name"), Some(&json!("Ada")));
        assert_eq!(full.model().name(), "Person");
        assert_eq!(m.count_documents().unwrap(), 1);
    }

    #[test]
    fn unique_index_is_enforced_after_create_indexes() {
        let m = model();
        m.create_indexes().unwrap();
        m.create(doc(json!({ "name": "a", "email": "x@e" }))).unwrap();
        let err = m
            .create(doc(json!({ "name": "b", "email": "x@e" })))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn reload_fails_after_delete() {
        let m = model();
        let mut rec = m.create(doc(json!({ "_id": "p2", "name": "Bob" }))).unwrap();
        rec.reload().unwrap();
        assert!(m.delete_by_id("p2").unwrap());
        assert!(rec.reload().unwrap_err().is_not_found());
        assert!(m.find(&Document::new()).unwrap().is_empty());
    }
}
