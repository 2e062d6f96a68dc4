//! Ephemeral instance builder.
//!
//! Every call provisions a brand-new memory server, opens a dedicated
//! connection to it, and binds a model. Nothing is cached or pooled; the
//! caller owns teardown through `server.stop()`.

use std::sync::Arc;

use crate::adapters::memory_server::{MemoryServer, MemoryServerOptions};
use crate::driver::{Connection, ConnectionUri};
use crate::model::Model;
use crate::{CoreError, Schema, SchemaDefinition, SchemaOptions};

/// What to provision.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryModelSpec {
    pub db_name: String,
    pub schema: SchemaDefinition,
    /// Model name, also used as the collection name.
    pub model_name: String,
}

/// A model bound to its own throwaway database.
#[derive(Debug)]
pub struct MemoryModel {
    pub model: Model,
    pub server: Arc<MemoryServer>,
    pub connection: Connection,
    pub uri: ConnectionUri,
}

impl MemoryModel {
    pub fn create(spec: MemoryModelSpec) -> Result<Self, CoreError> {
        let schema = Schema::new(&spec.schema, SchemaOptions::collection(&spec.model_name))?;
        let server = Arc::new(MemoryServer::start(MemoryServerOptions::database(
            spec.db_name,
        ))?);
        let uri = server.uri();
        // on error the server is dropped and stops itself
        let connection = Connection::open(&uri)?;
        let model = connection.model(&spec.model_name, schema)?;
        Ok(Self {
            model,
            server,
            connection,
            uri,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldOptions, FieldType};
    use serde_json::json;

    fn spec() -> MemoryModelSpec {
        MemoryModelSpec {
            db_name: "test".into(),
            schema: SchemaDefinition::new()
                .field("name", FieldOptions::new(FieldType::String).required()),
            model_name: "test.Test".into(),
        }
    }

    #[test]
    fn create_provisions_a_usable_isolated_model() {
        let a = MemoryModel::create(spec()).unwrap();
        let b = MemoryModel::create(spec()).unwrap();
        assert_ne!(a.uri, b.uri);
        assert_eq!(a.uri.database(), Some("test"));
        assert_eq!(a.model.collection_name(), "test.Test");

        let doc = json!({ "_id": "A", "name": "first" });
        let serde_json::Value::Object(doc) = doc else {
            panic!("object")
        };
        a.model.create(doc).unwrap();
        assert_eq!(a.model.count_documents().unwrap(), 1);
        assert_eq!(b.model.count_documents().unwrap(), 0);
    }

    #[test]
    fn stopping_the_server_releases_the_instance() {
        let mm = MemoryModel::create(spec()).unwrap();
        mm.server.stop().unwrap();
        assert!(!mm.server.is_running());
        assert!(mm.model.count_documents().unwrap_err().is_connection());
        assert!(Connection::open(&mm.uri).is_err());
    }

    #[test]
    fn invalid_schema_provisions_nothing() {
        let mut bad = spec();
        bad.model_name = String::new();
        assert!(MemoryModel::create(bad).unwrap_err().is_validation());
    }
}
