//! Connection pool keeper: one lazily opened connection per database name.
//!
//! `PoolSet::global()` is the process-wide set whose base connection string
//! comes from `DOCFIX_CONNECTION_STRING`. The variable is not validated up
//! front; a missing or malformed value surfaces on the first connection.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use tokio::sync::OnceCell;
use tracing::info;

use crate::driver::{Connection, ConnectionUri};
use crate::model::Model;
use crate::{poisoned, CoreError, Schema, SchemaDefinition, SchemaOptions};

/// Environment variable holding the base connection string.
pub const CONNECTION_STRING_ENV: &str = "DOCFIX_CONNECTION_STRING";

static GLOBAL: LazyLock<Arc<PoolSet>> =
    LazyLock::new(|| Arc::new(PoolSet::new(std::env::var(CONNECTION_STRING_ENV).ok())));

/// Pools keyed by database name, sharing one base connection string.
pub struct PoolSet {
    base_uri: Option<String>,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl PoolSet {
    pub fn new(base_uri: Option<String>) -> Self {
        Self {
            base_uri,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide pool set.
    pub fn global() -> Arc<PoolSet> {
        Arc::clone(&GLOBAL)
    }

    pub fn base_uri(&self) -> Option<&str> {
        self.base_uri.as_deref()
    }

    /// The pool for `database_name`, created on first request.
    pub fn get(&self, database_name: &str) -> Result<Arc<ConnectionPool>, CoreError> {
        let mut pools = self.pools.lock().map_err(|_| poisoned("pool set"))?;
        let pool = pools.entry(database_name.to_string()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(database_name, self.base_uri.clone()))
        });
        Ok(Arc::clone(pool))
    }

    pub fn database_names(&self) -> Result<Vec<String>, CoreError> {
        let pools = self.pools.lock().map_err(|_| poisoned("pool set"))?;
        let mut names: Vec<String> = pools.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Keeps the shared connection for one database. The connection is opened
/// once and never closed by callers.
pub struct ConnectionPool {
    database_name: String,
    base_uri: Option<String>,
    conn: OnceCell<Connection>,
}

impl ConnectionPool {
    pub fn new<S: Into<String>>(database_name: S, base_uri: Option<String>) -> Self {
        Self {
            database_name: database_name.into(),
            base_uri,
            conn: OnceCell::new(),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }

    /// The cached connection, opening it on first use. Concurrent callers
    /// share one attempt; a failed attempt leaves nothing cached.
    pub async fn connection(&self) -> Result<Connection, CoreError> {
        let conn = self.conn.get_or_try_init(|| self.open()).await?;
        Ok(conn.clone())
    }

    /// Drivers open synchronously, so the open runs on a blocking thread.
    async fn open(&self) -> Result<Connection, CoreError> {
        let database_name = self.database_name.clone();
        let base_uri = self.base_uri.clone();
        tokio::task::spawn_blocking(move || open_connection(&database_name, base_uri.as_deref()))
            .await
            .map_err(|e| CoreError::connection("error while initializing connection", e))?
    }

    /// Build the schema (collection = `model_name`) and bind a model to the
    /// pooled connection.
    pub async fn create_model(
        &self,
        definition: &SchemaDefinition,
        model_name: &str,
    ) -> Result<Model, CoreError> {
        let schema = Schema::new(definition, SchemaOptions::collection(model_name))?;
        let conn = self.connection().await?;
        conn.model(model_name, schema)
    }
}

fn open_connection(database_name: &str, base_uri: Option<&str>) -> Result<Connection, CoreError> {
    info!(database = %database_name, "attempting to connect to document store");
    let base = base_uri.ok_or_else(|| {
        CoreError::connection(
            "error while initializing connection",
            format!("{} is not set", CONNECTION_STRING_ENV),
        )
    })?;
    let uri = ConnectionUri::parse(base)?.with_database(database_name);
    Connection::open(&uri)
}
