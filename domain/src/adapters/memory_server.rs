//! In-process memory server: a throwaway, isolated document database.
//!
//! Each started server gets a unique `memdb://127.0.0.1:<port>/<db>` URI and
//! is reachable through the `memdb` driver until it is stopped. Stopping is
//! idempotent and cuts off every connection opened against the server. A
//! server dropped while still running stops itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::driver::ConnectionUri;
use crate::{
    id_key, matches_filter, poisoned, CollectionStore, CoreError, Database, Document, Driver,
    ID_FIELD,
};

/// URI scheme served by `MemoryDriver`.
pub const MEMORY_SCHEME: &str = "memdb";

const HOST: &str = "127.0.0.1";
const FIRST_PORT: u32 = 27100;
const PORT_RANGE: u32 = 30000;

static SERVERS: LazyLock<Mutex<HashMap<String, Arc<ServerState>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_PORT: AtomicU32 = AtomicU32::new(0);

struct ServerState {
    default_db: String,
    running: Arc<AtomicBool>,
    databases: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
}

impl ServerState {
    fn database(&self, name: &str) -> Result<Arc<MemoryDatabase>, CoreError> {
        let mut dbs = self.databases.lock().map_err(|_| poisoned("memory server"))?;
        let db = dbs.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryDatabase {
                name: name.to_string(),
                running: Arc::clone(&self.running),
                collections: Mutex::new(BTreeMap::new()),
            })
        });
        Ok(Arc::clone(db))
    }
}

/// Options for starting a memory server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryServerOptions {
    /// Database the server URI points at.
    pub db_name: String,
}

impl MemoryServerOptions {
    pub fn database<S: Into<String>>(name: S) -> Self {
        Self {
            db_name: name.into(),
        }
    }
}

impl Default for MemoryServerOptions {
    fn default() -> Self {
        Self::database("test")
    }
}

/// Lifecycle handle of one in-memory database instance.
pub struct MemoryServer {
    authority: String,
    db_name: String,
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn start(options: MemoryServerOptions) -> Result<Self, CoreError> {
        let mut servers = SERVERS.lock().map_err(|_| poisoned("memory server registry"))?;
        let mut authority = None;
        for _ in 0..PORT_RANGE {
            let port = FIRST_PORT + NEXT_PORT.fetch_add(1, Ordering::Relaxed) % PORT_RANGE;
            let candidate = format!("{}:{}", HOST, port);
            if !servers.contains_key(&candidate) {
                authority = Some(candidate);
                break;
            }
        }
        let authority = authority.ok_or_else(|| {
            CoreError::connection("failed to start memory server", "no free port left")
        })?;

        let state = Arc::new(ServerState {
            default_db: options.db_name.clone(),
            running: Arc::new(AtomicBool::new(true)),
            databases: Mutex::new(HashMap::new()),
        });
        servers.insert(authority.clone(), Arc::clone(&state));
        drop(servers);

        let server = Self {
            authority,
            db_name: options.db_name,
            state,
        };
        info!(uri = %server.uri(), "memory server started");
        Ok(server)
    }

    pub fn uri(&self) -> ConnectionUri {
        ConnectionUri::new(MEMORY_SCHEME, &self.authority, Some(&self.db_name))
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Stop the server. Later calls are no-ops.
    pub fn stop(&self) -> Result<(), CoreError> {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        SERVERS
            .lock()
            .map_err(|_| poisoned("memory server registry"))?
            .remove(&self.authority);
        self.state
            .databases
            .lock()
            .map_err(|_| poisoned("memory server"))?
            .clear();
        info!(uri = %self.uri(), "memory server stopped");
        Ok(())
    }
}

/// URIs of every server still running in this process.
pub fn running_servers() -> Result<Vec<ConnectionUri>, CoreError> {
    let servers = SERVERS.lock().map_err(|_| poisoned("memory server registry"))?;
    let mut uris: Vec<ConnectionUri> = servers
        .iter()
        .map(|(authority, state)| {
            ConnectionUri::new(MEMORY_SCHEME, authority, Some(&state.default_db))
        })
        .collect();
    uris.sort_by_key(|uri| uri.to_string());
    Ok(uris)
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!(error = %e, authority = %self.authority, "failed to stop memory server on drop");
            }
        }
    }
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryServer")
            .field("uri", &self.uri().to_string())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Driver for `memdb://` URIs; resolves running memory servers by authority.
pub struct MemoryDriver;

impl Driver for MemoryDriver {
    fn connect(&self, uri: &ConnectionUri) -> Result<Arc<dyn Database>, CoreError> {
        let state = SERVERS
            .lock()
            .map_err(|_| poisoned("memory server registry"))?
            .get(uri.authority())
            .cloned()
            .ok_or_else(|| {
                CoreError::connection(
                    format!("failed to connect to {}", uri),
                    format!("no memory server listening at {}", uri.authority()),
                )
            })?;
        let name = uri.database().unwrap_or(state.default_db.as_str());
        let db: Arc<dyn Database> = state.database(name)?;
        Ok(db)
    }
}

fn ensure_running(running: &AtomicBool, what: &str) -> Result<(), CoreError> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(CoreError::connection(
            "memory server stopped",
            format!("{} is no longer reachable", what),
        ))
    }
}

/// One database of a memory server.
pub struct MemoryDatabase {
    name: String,
    running: Arc<AtomicBool>,
    collections: Mutex<BTreeMap<String, Arc<MemoryCollection>>>,
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn CollectionStore>, CoreError> {
        ensure_running(&self.running, &self.name)?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| poisoned("memory database"))?;
        let coll = collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryCollection::new(name, Arc::clone(&self.running)))
        });
        let coll: Arc<dyn CollectionStore> = Arc::clone(coll) as Arc<dyn CollectionStore>;
        Ok(coll)
    }

    fn collection_names(&self) -> Result<Vec<String>, CoreError> {
        ensure_running(&self.running, &self.name)?;
        let collections = self
            .collections
            .lock()
            .map_err(|_| poisoned("memory database"))?;
        Ok(collections.keys().cloned().collect())
    }
}

#[derive(Default)]
struct CollectionData {
    docs: Vec<Document>,
    unique: Vec<String>,
    indexed: Vec<String>,
}

/// Documents of one collection, kept in insertion order.
pub struct MemoryCollection {
    name: String,
    running: Arc<AtomicBool>,
    inner: Mutex<CollectionData>,
}

impl MemoryCollection {
    fn new(name: &str, running: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_string(),
            running,
            inner: Mutex::new(CollectionData::default()),
        }
    }

    /// A collection that belongs to no server and is always reachable.
    pub fn detached(name: &str) -> Self {
        Self::new(name, Arc::new(AtomicBool::new(true)))
    }

    fn data(&self) -> Result<MutexGuard<'_, CollectionData>, CoreError> {
        ensure_running(&self.running, &self.name)?;
        self.inner.lock().map_err(|_| poisoned("memory collection"))
    }

    fn duplicate_key(&self, field: &str, value: &Value) -> CoreError {
        CoreError::validation(
            format!("duplicate key in collection '{}' for '{}'", self.name, field),
            json!({ "collection": self.name, "field": field, "value": value }),
        )
    }
}

fn doc_id(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(id_key)
}

impl CollectionStore for MemoryCollection {
    fn insert_one(&self, doc: Document) -> Result<(), CoreError> {
        let id = doc_id(&doc).ok_or_else(|| {
            CoreError::validation(
                "document must carry an _id",
                json!({ "collection": self.name }),
            )
        })?;
        let mut data = self.data()?;
        if data.docs.iter().any(|d| doc_id(d).as_deref() == Some(id.as_str())) {
            return Err(self.duplicate_key(ID_FIELD, &json!(id)));
        }
        for field in &data.unique {
            if let Some(value) = doc.get(field).filter(|v| !v.is_null()) {
                if data.docs.iter().any(|d| d.get(field) == Some(value)) {
                    return Err(self.duplicate_key(field, value));
                }
            }
        }
        debug!(collection = %self.name, id = %id, "memory insert");
        data.docs.push(doc);
        Ok(())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Document>, CoreError> {
        let data = self.data()?;
        Ok(data
            .docs
            .iter()
            .find(|d| doc_id(d).as_deref() == Some(id))
            .cloned())
    }

    fn find(&self, filter: &Document) -> Result<Vec<Document>, CoreError> {
        let data = self.data()?;
        Ok(data
            .docs
            .iter()
            .filter(|d| matches_filter(d, filter))
            .cloned()
            .collect())
    }

    fn delete_by_id(&self, id: &str) -> Result<bool, CoreError> {
        let mut data = self.data()?;
        match data.docs.iter().position(|d| doc_id(d).as_deref() == Some(id)) {
            Some(idx) => {
                data.docs.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn count(&self) -> Result<usize, CoreError> {
        Ok(self.data()?.docs.len())
    }

    fn create_index(&self, field: &str, unique: bool) -> Result<(), CoreError> {
        let mut data = self.data()?;
        if !unique {
            if !data.indexed.iter().any(|f| f == field) {
                data.indexed.push(field.to_string());
            }
            return Ok(());
        }
        if data.unique.iter().any(|f| f == field) {
            return Ok(());
        }
        let mut seen = HashSet::new();
        for value in data.docs.iter().filter_map(|d| d.get(field)) {
            if !value.is_null() && !seen.insert(value.to_string()) {
                return Err(self.duplicate_key(field, value));
            }
        }
        data.unique.push(field.to_string());
        Ok(())
    }
}
