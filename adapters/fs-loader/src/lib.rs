//! fs-loader: filesystem discovery of model and fixture descriptors.
//!
//! - `ModelFiles` walks a root for `*.model.json` files, each holding one
//!   `{ modelName, dbName, schema }` descriptor.
//! - `FixtureFiles` walks `<dir>/<dbName>/<collectionName>/*.json`, each file
//!   holding one `{ name, docContents }` fixture.
//!
//! Paths are sorted before parsing so load order is deterministic. Hidden
//! directories, `target/` and `examples/` are never entered.

use std::fs;
use std::path::{Path, PathBuf};

use docfix_domain::{CoreError, DescriptorProvider, FixtureDoc, FixtureSource, ModelDescriptor};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

pub const MODEL_SUFFIX: &str = ".model.json";
pub const FIXTURE_SUFFIX: &str = ".json";

const SKIPPED_DIRS: &[&str] = &["target", "examples"];

/// `*.model.json` files under `root`.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    root: PathBuf,
}

impl ModelFiles {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DescriptorProvider<ModelDescriptor> for ModelFiles {
    fn descriptors(&self) -> Result<Vec<ModelDescriptor>, CoreError> {
        let files = walk(&self.root, MODEL_SUFFIX)?;
        debug!(root = %self.root.display(), count = files.len(), "discovered model files");
        files.iter().map(|path| read_json(path)).collect()
    }
}

/// Fixture files under `dir`, two directory levels deep.
#[derive(Debug, Clone)]
pub struct FixtureFiles {
    dir: PathBuf,
}

impl FixtureFiles {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, path: &Path) -> Option<(String, String)> {
        let relative = path.strip_prefix(&self.dir).ok()?;
        let parts: Vec<&str> = relative
            .iter()
            .map(|part| part.to_str())
            .collect::<Option<_>>()?;
        match parts.as_slice() {
            [db, collection, _file] => Some((db.to_string(), collection.to_string())),
            _ => None,
        }
    }
}

impl DescriptorProvider<FixtureSource> for FixtureFiles {
    fn descriptors(&self) -> Result<Vec<FixtureSource>, CoreError> {
        if !self.dir.is_dir() {
            warn!(dir = %self.dir.display(), "fixtures directory not found");
            return Ok(Vec::new());
        }
        let mut sources = Vec::new();
        for path in walk(&self.dir, FIXTURE_SUFFIX)? {
            let Some((db_name, collection_name)) = self.locate(&path) else {
                warn!(path = %path.display(), "skipping fixture outside <db>/<collection>/");
                continue;
            };
            let fixture: FixtureDoc = read_json(&path)?;
            debug!(path = %path.display(), db = %db_name, collection = %collection_name, "fixture file");
            sources.push(FixtureSource {
                db_name,
                collection_name,
                fixture,
            });
        }
        Ok(sources)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CoreError> {
    let raw = fs::read_to_string(path).map_err(|e| map_ioerr(path, e))?;
    serde_json::from_str(&raw).map_err(|e| {
        CoreError::validation(
            format!("invalid descriptor file {}: {}", path.display(), e),
            json!({ "path": path.display().to_string() }),
        )
    })
}

/// Files under `root` whose name ends with `suffix`, sorted.
fn walk(root: &Path, suffix: &str) -> Result<Vec<PathBuf>, CoreError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| map_ioerr(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| map_ioerr(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let kind = entry.file_type().map_err(|e| map_ioerr(&path, e))?;
            if kind.is_dir() {
                if !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref()) {
                    pending.push(path);
                }
            } else if kind.is_file() && name.ends_with(suffix) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn map_ioerr(path: &Path, e: std::io::Error) -> CoreError {
    CoreError::Repository(format!("io error at {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docfix_domain::FieldType;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    const USER_MODEL: &str = r#"{
        "modelName": "User",
        "dbName": "app",
        "schema": { "name": { "type": "String", "required": true }, "age": "Number" }
    }"#;

    #[test]
    fn model_files_are_found_recursively_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/user.model.json", USER_MODEL);
        write(
            dir.path(),
            "a/nested/order.model.json",
            r#"{ "modelName": "Order", "dbName": "shop", "schema": {} }"#,
        );
        write(dir.path(), "a/readme.json", "{}");

        let models = ModelFiles::new(dir.path()).descriptors().unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.model_name.as_str()).collect();
        assert_eq!(names, vec!["Order", "User"]);

        let user = &models[1];
        assert_eq!(user.db_name, "app");
        assert_eq!(user.schema.len(), 2);
        assert_eq!(
            user.schema.get("age").map(|f| f.options().kind),
            Some(FieldType::Number)
        );
    }

    #[test]
    fn hidden_and_build_dirs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".git/user.model.json", USER_MODEL);
        write(dir.path(), "target/debug/user.model.json", USER_MODEL);
        write(dir.path(), "examples/user.model.json", USER_MODEL);
        assert!(ModelFiles::new(dir.path()).descriptors().unwrap().is_empty());
    }

    #[test]
    fn malformed_model_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.model.json", "{ not json");
        let err = ModelFiles::new(dir.path()).descriptors().unwrap_err();
        assert!(err.is_validation());
        let path = err.context().unwrap()["path"].as_str().unwrap().to_string();
        assert!(path.ends_with("broken.model.json"));
    }

    #[test]
    fn fixtures_take_db_and_collection_from_their_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "test/test.Test/0_test.json",
            r#"{ "name": "0_test", "docContents": { "_id": "A", "name": "0_test" } }"#,
        );
        write(
            dir.path(),
            "test/test.Test/1_test.json",
            r#"{ "name": "1_test", "docContents": { "_id": "B", "name": "1_test" } }"#,
        );
        write(dir.path(), "stray.json", r#"{ "name": "x", "docContents": {} }"#);

        let sources = FixtureFiles::new(dir.path()).descriptors().unwrap();
        assert_eq!(sources.len(), 2);
        for (source, (name, id)) in sources.iter().zip([("0_test", "A"), ("1_test", "B")]) {
            assert_eq!(source.db_name, "test");
            assert_eq!(source.collection_name, "test.Test");
            assert_eq!(source.fixture.name, name);
            assert_eq!(source.fixture.id().unwrap(), id);
        }
    }

    #[test]
    fn missing_fixtures_dir_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = FixtureFiles::new(dir.path().join("absent"));
        assert!(files.descriptors().unwrap().is_empty());
    }
}
