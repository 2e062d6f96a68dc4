//! sqlite-adapter — SQLite implementation of the document store ports.
//!
//! Purpose
//! - Back the pooled connections with real files when tests want state that
//!   outlives a process, or a store other than the in-process memory server.
//! - `install(root)` registers the `sqlite` scheme; a URI such as
//!   `sqlite://local/app` then opens `<root>/app.sqlite3`.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - One table per collection: `(id TEXT PRIMARY KEY, body TEXT NOT NULL)`,
//!   with the document stored as JSON text. Indexes are expression indexes
//!   over `json_extract(body, ...)`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use docfix_domain::driver::{register_driver, ConnectionUri};
use docfix_domain::{
    id_key, matches_filter, CollectionStore, CoreError, Database, Document, Driver, ID_FIELD,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const SQLITE_SCHEME: &str = "sqlite";
const FILE_EXTENSION: &str = "sqlite3";

/// Register the SQLite driver for `sqlite://` URIs, storing databases under
/// `root`.
pub fn install<P: Into<PathBuf>>(root: P) -> Result<(), CoreError> {
    register_driver(SQLITE_SCHEME, Arc::new(SqliteDriver::new(root)))
}

/// Opens `<root>/<database>.sqlite3` for each connection.
pub struct SqliteDriver {
    root: PathBuf,
}

impl SqliteDriver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, database: &str) -> PathBuf {
        self.root.join(format!("{}.{}", database, FILE_EXTENSION))
    }
}

impl Driver for SqliteDriver {
    fn connect(&self, uri: &ConnectionUri) -> Result<Arc<dyn Database>, CoreError> {
        let name = uri.database().ok_or_else(|| {
            CoreError::connection(
                format!("failed to connect to {}", uri),
                "sqlite connection string needs a database path",
            )
        })?;
        std::fs::create_dir_all(&self.root).map_err(|e| {
            CoreError::connection(format!("failed to connect to {}", uri), e)
        })?;
        let db = SqliteDatabase::open(name, self.path_for(name))
            .map_err(|e| CoreError::connection(format!("failed to connect to {}", uri), e))?;
        Ok(Arc::new(db))
    }
}

/// One SQLite file acting as a logical database.
pub struct SqliteDatabase {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) the database file at `path`.
    pub fn open<P: AsRef<Path>>(name: &str, path: P) -> Result<Self, CoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqerr)?;
        info!(database = name, path = %path.as_ref().display(), "opened sqlite database");
        Ok(Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A throwaway in-memory database.
    pub fn in_memory(name: &str) -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqerr)?;
        Ok(Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl Database for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn CollectionStore>, CoreError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
            quote_ident(name)
        ))
        .map_err(map_sqerr)?;
        Ok(Arc::new(SqliteCollection {
            name: name.to_string(),
            conn: Arc::clone(&self.conn),
        }))
    }

    fn collection_names(&self) -> Result<Vec<String>, CoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .map_err(map_sqerr)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqerr)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqerr)
    }
}

/// One collection, stored as a table of JSON bodies.
pub struct SqliteCollection {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCollection {
    fn table(&self) -> String {
        quote_ident(&self.name)
    }

    /// Constraint failures become duplicate-key validation errors. `field` is
    /// `None` when the failing unique index is not known up front.
    fn map_write_err(&self, e: rusqlite::Error, field: Option<&str>) -> CoreError {
        match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => CoreError::validation(
                format!("duplicate key in collection '{}': {}", self.name, e),
                json!({ "collection": self.name, "field": field }),
            ),
            _ => map_sqerr(e),
        }
    }

    fn contains(&self, conn: &Connection, id: &str) -> Result<bool, CoreError> {
        conn.query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", self.table()),
            params![id],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(map_sqerr)
    }
}

impl CollectionStore for SqliteCollection {
    fn insert_one(&self, doc: Document) -> Result<(), CoreError> {
        let id = doc.get(ID_FIELD).and_then(id_key).ok_or_else(|| {
            CoreError::validation(
                "document must carry an _id",
                json!({ "collection": self.name }),
            )
        })?;
        let body = serde_json::to_string(&doc).map_err(map_sqerr)?;
        let conn = lock(&self.conn)?;
        if self.contains(&conn, &id)? {
            return Err(CoreError::validation(
                format!("duplicate key in collection '{}' for '{}'", self.name, ID_FIELD),
                json!({ "collection": self.name, "field": ID_FIELD, "value": id }),
            ));
        }
        conn.execute(
            &format!("INSERT INTO {} (id, body) VALUES (?1, ?2)", self.table()),
            params![id, body],
        )
        .map_err(|e| self.map_write_err(e, None))?;
        debug!(collection = %self.name, id = %id, "sqlite insert");
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Document>, CoreError> {
        let conn = lock(&self.conn)?;
        let body: Option<String> = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", self.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        body.map(|b| parse_body(&b)).transpose()
    }

    fn find(&self, filter: &Document) -> Result<Vec<Document>, CoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!("SELECT body FROM {} ORDER BY rowid", self.table()))
            .map_err(map_sqerr)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqerr)?;
        let mut docs = Vec::new();
        for body in rows {
            let doc = parse_body(&body.map_err(map_sqerr)?)?;
            if matches_filter(&doc, filter) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn delete_by_id(&self, id: &str) -> Result<bool, CoreError> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.table()),
                params![id],
            )
            .map_err(map_sqerr)?;
        Ok(n > 0)
    }

    fn count(&self) -> Result<usize, CoreError> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table()), [], |row| {
                row.get(0)
            })
            .map_err(map_sqerr)?;
        Ok(n as usize)
    }

    fn create_index(&self, field: &str, unique: bool) -> Result<(), CoreError> {
        let index = quote_ident(&format!("{}_{}", self.name, field));
        let path = format!("$.\"{}\"", field.replace('"', "\\\""));
        let sql = format!(
            "CREATE {} INDEX IF NOT EXISTS {} ON {} (json_extract(body, {}))",
            if unique { "UNIQUE" } else { "" },
            index,
            self.table(),
            quote_literal(&path),
        );
        let conn = lock(&self.conn)?;
        conn.execute_batch(&sql)
            .map_err(|e| self.map_write_err(e, Some(field)))
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, CoreError> {
    conn.lock()
        .map_err(|_| CoreError::Repository("mutex poisoned".into()))
}

fn parse_body(body: &str) -> Result<Document, CoreError> {
    match serde_json::from_str::<Value>(body).map_err(map_sqerr)? {
        Value::Object(doc) => Ok(doc),
        other => Err(CoreError::Repository(format!(
            "sqlite error: stored body is not an object: {other}"
        ))),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docfix_domain::driver::Connection as StoreConnection;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn tmp_db() -> (SqliteDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::open("t", dir.path().join("t.sqlite3")).unwrap();
        (db, dir)
    }

    #[test]
    fn insert_find_roundtrip() {
        let (db, _dir) = tmp_db();
        let coll = db.collection("test.Test").unwrap();
        coll.insert_one(doc(json!({ "_id": "A", "name": "0_test", "n": 1 })))
            .unwrap();
        coll.insert_one(doc(json!({ "_id": "B", "name": "1_test", "n": 2 })))
            .unwrap();

        let got = coll.find_by_id("A").unwrap().unwrap();
        assert_eq!(got["name"], json!("0_test"));
        assert!(coll.find_by_id("missing").unwrap().is_none());
        assert_eq!(coll.count().unwrap(), 2);

        let found = coll.find(&doc(json!({ "n": 2 }))).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!("B"));

        let all = coll.find(&Document::new()).unwrap();
        let ids: Vec<&Value> = all.iter().map(|d| &d["_id"]).collect();
        assert_eq!(ids, vec![&json!("A"), &json!("B")]);
        assert_eq!(db.collection_names().unwrap(), vec!["test.Test"]);
    }

    #[test]
    fn duplicate_id_is_a_validation_error() {
        let (db, _dir) = tmp_db();
        let coll = db.collection("things").unwrap();
        coll.insert_one(doc(json!({ "_id": "dup" }))).unwrap();
        let err = coll.insert_one(doc(json!({ "_id": "dup" }))).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.context().unwrap()["field"], json!("_id"));
    }

    #[test]
    fn unique_index_rejects_repeated_values() {
        let db = SqliteDatabase::in_memory("mem").unwrap();
        let coll = db.collection("users").unwrap();
        coll.create_index("email", true).unwrap();
        coll.create_index("email", true).unwrap();
        coll.create_index("name", false).unwrap();

        coll.insert_one(doc(json!({ "_id": "1", "email": "a@x.io" })))
            .unwrap();
        coll.insert_one(doc(json!({ "_id": "2" }))).unwrap();
        coll.insert_one(doc(json!({ "_id": "3" }))).unwrap();
        let err = coll
            .insert_one(doc(json!({ "_id": "4", "email": "a@x.io" })))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(coll.count().unwrap(), 3);
    }

    #[test]
    fn unique_index_over_existing_duplicates_fails() {
        let db = SqliteDatabase::in_memory("mem").unwrap();
        let coll = db.collection("users").unwrap();
        coll.insert_one(doc(json!({ "_id": "1", "email": "a@x.io" })))
            .unwrap();
        coll.insert_one(doc(json!({ "_id": "2", "email": "a@x.io" })))
            .unwrap();
        let err = coll.create_index("email", true).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.context().unwrap()["field"], json!("email"));
    }

    #[test]
    fn delete_reports_whether_a_row_went_away() {
        let (db, _dir) = tmp_db();
        let coll = db.collection("things").unwrap();
        coll.insert_one(doc(json!({ "_id": "x" }))).unwrap();
        assert!(coll.delete_by_id("x").unwrap());
        assert!(!coll.delete_by_id("x").unwrap());
        assert_eq!(coll.count().unwrap(), 0);
    }

    #[test]
    fn driver_opens_one_file_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SqliteDriver::new(dir.path().join("dbs"));
        let uri = ConnectionUri::parse("sqlite://local/app").unwrap();

        let first = driver.connect(&uri).unwrap();
        first
            .collection("c")
            .unwrap()
            .insert_one(doc(json!({ "_id": "1" })))
            .unwrap();
        assert!(driver.path_for("app").is_file());

        let second = driver.connect(&uri).unwrap();
        assert_eq!(second.name(), "app");
        assert_eq!(second.collection("c").unwrap().count().unwrap(), 1);

        let no_db = ConnectionUri::parse("sqlite://local").unwrap();
        assert!(driver.connect(&no_db).err().unwrap().is_connection());
    }

    #[test]
    fn installed_driver_serves_sqlite_uris() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();
        let uri = ConnectionUri::parse("sqlite://local/shop").unwrap();
        let conn = StoreConnection::open(&uri).unwrap();
        assert_eq!(conn.database().name(), "shop");
        assert!(docfix_domain::driver::registered_schemes()
            .unwrap()
            .contains(&SQLITE_SCHEME.to_string()));
    }
}
