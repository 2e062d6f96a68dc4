//! Schema definitions and document casting.
//!
//! A `SchemaDefinition` is the declarative field map found in schema files.
//! Compiling it with `SchemaOptions` yields a `Schema`, which casts documents
//! on write: unknown fields are stripped (strict mode), defaults applied,
//! required fields enforced, `_id` generated when absent, and the version key
//! added.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{id_key, CoreError, Document, ID_FIELD};

/// Version key stamped onto every created document.
pub const VERSION_KEY: &str = "__v";

/// Supported field types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Mixed,
    Array,
    Object,
}

impl FieldType {
    /// Whether a non-null value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            // ISO-8601 strings or epoch millis
            FieldType::Date => value.is_string() || value.is_number(),
            FieldType::ObjectId => value.as_str().is_some_and(is_object_id),
            FieldType::Mixed => true,
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::ObjectId => "ObjectId",
            FieldType::Mixed => "Mixed",
            FieldType::Array => "Array",
            FieldType::Object => "Object",
        }
    }
}

/// 24 hexadecimal characters.
pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Generate a fresh object id.
pub fn new_object_id() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(24);
    hex
}

/// Full field options, as written `{ "type": "String", "required": true }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldOptions {
    pub fn new(kind: FieldType) -> Self {
        Self {
            kind,
            required: false,
            unique: false,
            index: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A field as written in a schema file: either a bare type name or options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Type(FieldType),
    Options(FieldOptions),
}

impl FieldSpec {
    pub fn options(&self) -> FieldOptions {
        match self {
            FieldSpec::Type(kind) => FieldOptions::new(*kind),
            FieldSpec::Options(opts) => opts.clone(),
        }
    }
}

impl From<FieldType> for FieldSpec {
    fn from(kind: FieldType) -> Self {
        FieldSpec::Type(kind)
    }
}

impl From<FieldOptions> for FieldSpec {
    fn from(opts: FieldOptions) -> Self {
        FieldSpec::Options(opts)
    }
}

/// Declarative field map of a model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaDefinition(BTreeMap<String, FieldSpec>);

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field declaration.
    pub fn field<N: Into<String>, S: Into<FieldSpec>>(mut self, name: N, spec: S) -> Self {
        self.0.insert(name.into(), spec.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.0.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Options applied when compiling a schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaOptions {
    pub collection: String,
    /// Drop fields not declared in the schema.
    pub strict: bool,
    /// Stamp `__v` onto created documents.
    pub version_key: bool,
}

impl SchemaOptions {
    pub fn collection<S: Into<String>>(name: S) -> Self {
        Self {
            collection: name.into(),
            strict: true,
            version_key: true,
        }
    }
}

/// A compiled schema bound to a collection name.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, FieldOptions>,
    options: SchemaOptions,
}

impl Schema {
    pub fn new(definition: &SchemaDefinition, options: SchemaOptions) -> Result<Self, CoreError> {
        if options.collection.is_empty() {
            return Err(CoreError::validation(
                "schema collection name is empty",
                json!({}),
            ));
        }
        let mut fields = BTreeMap::new();
        for (name, spec) in definition.fields() {
            let opts = spec.options();
            let reject = |reason: &str| {
                CoreError::validation(
                    format!("invalid field '{}': {}", name, reason),
                    json!({ "collection": options.collection, "field": name }),
                )
            };
            if name.is_empty() || name.starts_with('$') || name.contains('.') {
                return Err(reject("bad field name"));
            }
            if name == VERSION_KEY {
                return Err(reject("reserved for the version key"));
            }
            if name == ID_FIELD
                && !matches!(
                    opts.kind,
                    FieldType::String | FieldType::Number | FieldType::ObjectId | FieldType::Mixed
                )
            {
                return Err(reject("_id must be a String, Number, or ObjectId"));
            }
            if let Some(default) = &opts.default {
                if !default.is_null() && !opts.kind.accepts(default) {
                    return Err(reject("default does not match the field type"));
                }
            }
            fields.insert(name.clone(), opts);
        }
        Ok(Self { fields, options })
    }

    pub fn collection(&self) -> &str {
        &self.options.collection
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub fn field(&self, name: &str) -> Option<&FieldOptions> {
        self.fields.get(name)
    }

    /// Fields that need an index, as `(field, unique)`.
    pub fn indexes(&self) -> Vec<(String, bool)> {
        self.fields
            .iter()
            .filter(|(name, opts)| name.as_str() != ID_FIELD && (opts.unique || opts.index))
            .map(|(name, opts)| (name.clone(), opts.unique))
            .collect()
    }

    /// Cast a document for writing.
    pub fn cast(&self, mut doc: Document) -> Result<Document, CoreError> {
        let mut out = Document::new();

        let id = match doc.remove(ID_FIELD) {
            Some(v) if v.is_null() => Value::String(new_object_id()),
            Some(v) => v,
            None => Value::String(new_object_id()),
        };
        let id_ok = id_key(&id).is_some()
            && self
                .fields
                .get(ID_FIELD)
                .map_or(true, |opts| opts.kind.accepts(&id));
        if !id_ok {
            return Err(CoreError::validation(
                "cast failed for _id",
                json!({ "collection": self.collection(), "field": ID_FIELD, "value": id }),
            ));
        }
        out.insert(ID_FIELD.to_string(), id);

        for (name, opts) in &self.fields {
            if name == ID_FIELD {
                continue;
            }
            let value = match doc.remove(name) {
                None => opts.default.clone(),
                Some(v) => Some(v),
            };
            match value {
                None | Some(Value::Null) if opts.required => {
                    return Err(CoreError::validation(
                        format!("path '{}' is required", name),
                        json!({ "collection": self.collection(), "field": name }),
                    ));
                }
                None => {}
                Some(v) => {
                    if !v.is_null() && !opts.kind.accepts(&v) {
                        return Err(CoreError::validation(
                            format!("cast to {} failed for path '{}'", opts.kind.as_str(), name),
                            json!({ "collection": self.collection(), "field": name, "value": v }),
                        ));
                    }
                    out.insert(name.clone(), v);
                }
            }
        }

        let version = doc.remove(VERSION_KEY);
        if !self.options.strict {
            out.extend(doc);
        }
        if self.options.version_key {
            let version = version.filter(Value::is_number).unwrap_or(json!(0));
            out.insert(VERSION_KEY.to_string(), version);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn user_schema() -> Schema {
        let def = SchemaDefinition::new()
            .field("name", FieldOptions::new(FieldType::String).required())
            .field("email", FieldOptions::new(FieldType::String).unique())
            .field("active", FieldOptions::new(FieldType::Boolean).with_default(json!(true)))
            .field("age", FieldType::Number);
        Schema::new(&def, SchemaOptions::collection("users")).unwrap()
    }

    #[test]
    fn definition_parses_shorthand_and_options() {
        let def: SchemaDefinition = serde_json::from_value(json!({
            "name": { "type": "String", "required": true },
            "age": "Number",
            "tags": { "type": "Array", "default": [] }
        }))
        .unwrap();
        assert_eq!(def.len(), 3);
        assert_eq!(def.get("age"), Some(&FieldSpec::Type(FieldType::Number)));
        let name = def.get("name").unwrap().options();
        assert!(name.required);
        assert_eq!(name.kind, FieldType::String);
        assert_eq!(def.get("tags").unwrap().options().default, Some(json!([])));
    }

    #[test]
    fn unknown_type_name_is_rejected() {
        let parsed: Result<SchemaDefinition, _> =
            serde_json::from_value(json!({ "name": "Text" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn cast_applies_defaults_strips_unknown_and_stamps_version() {
        let out = user_schema()
            .cast(doc(json!({ "_id": "u1", "name": "Ada", "extra": 1 })))
            .unwrap();
        assert_eq!(out["_id"], json!("u1"));
        assert_eq!(out["active"], json!(true));
        assert_eq!(out[VERSION_KEY], json!(0));
        assert!(!out.contains_key("extra"));
        assert!(!out.contains_key("age"));
    }

    #[test]
    fn cast_generates_object_id() {
        let out = user_schema().cast(doc(json!({ "name": "Ada" }))).unwrap();
        let id = out["_id"].as_str().unwrap();
        assert!(is_object_id(id));
    }

    #[test]
    fn cast_enforces_required_and_types() {
        let schema = user_schema();
        let err = schema.cast(doc(json!({ "age": 3 }))).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.context().unwrap()["field"], json!("name"));

        let err = schema
            .cast(doc(json!({ "name": "Ada", "age": "three" })))
            .unwrap_err();
        assert!(err.to_string().contains("cast to Number failed"));
    }

    #[test]
    fn non_strict_keeps_unknown_fields() {
        let def = SchemaDefinition::new().field("name", FieldType::String);
        let mut options = SchemaOptions::collection("loose");
        options.strict = false;
        options.version_key = false;
        let schema = Schema::new(&def, options).unwrap();
        let out = schema
            .cast(doc(json!({ "_id": 7, "name": "x", "extra": [1] })))
            .unwrap();
        assert_eq!(out["extra"], json!([1]));
        assert!(!out.contains_key(VERSION_KEY));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let reserved = SchemaDefinition::new().field(VERSION_KEY, FieldType::Number);
        assert!(Schema::new(&reserved, SchemaOptions::collection("c")).is_err());

        let bad_id = SchemaDefinition::new().field(ID_FIELD, FieldType::Boolean);
        assert!(Schema::new(&bad_id, SchemaOptions::collection("c")).is_err());

        let bad_default = SchemaDefinition::new().field(
            "n",
            FieldOptions::new(FieldType::Number).with_default(json!("zero")),
        );
        assert!(Schema::new(&bad_default, SchemaOptions::collection("c")).is_err());
    }

    #[test]
    fn indexes_list_unique_and_indexed_fields() {
        assert_eq!(user_schema().indexes(), vec![("email".to_string(), true)]);
    }
}
