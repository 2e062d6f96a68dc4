//! Connection URIs, the process-wide driver registry, and live connections.
//!
//! Drivers are looked up by URI scheme. The `memdb` scheme (the in-process
//! memory server) is always available; other drivers register themselves at
//! startup, e.g. `sqlite_adapter::install`.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, LazyLock, RwLock};

use tracing::info;

use crate::adapters::memory_server::{MemoryDriver, MEMORY_SCHEME};
use crate::model::Model;
use crate::{poisoned, CoreError, Database, Driver, Schema};

/// A parsed `scheme://authority/path?query` connection string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionUri {
    scheme: String,
    authority: String,
    path: String,
    query: Option<String>,
}

impl ConnectionUri {
    pub fn new(scheme: &str, authority: &str, database: Option<&str>) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            path: database.map(|db| format!("/{}", db)).unwrap_or_default(),
            query: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| {
            CoreError::connection(
                format!("invalid connection string '{}'", raw),
                reason.to_string(),
            )
        };

        let (scheme, rest) = raw.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid("bad scheme"));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q.to_string())),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            path: path.to_string(),
            query,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First path segment, if any.
    pub fn database(&self) -> Option<&str> {
        self.path
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Copy of this URI whose path is replaced by `/<name>`.
    pub fn with_database(&self, name: &str) -> Self {
        Self {
            path: format!("/{}", name),
            ..self.clone()
        }
    }
}

impl Display for ConnectionUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{}", q)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionUri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

type DriverMap = HashMap<String, Arc<dyn Driver>>;

static DRIVERS: LazyLock<RwLock<DriverMap>> = LazyLock::new(|| {
    let mut map: DriverMap = HashMap::new();
    map.insert(MEMORY_SCHEME.to_string(), Arc::new(MemoryDriver));
    RwLock::new(map)
});

/// Register (or replace) the driver for a URI scheme.
pub fn register_driver(scheme: &str, driver: Arc<dyn Driver>) -> Result<(), CoreError> {
    let mut drivers = DRIVERS.write().map_err(|_| poisoned("driver registry"))?;
    drivers.insert(scheme.to_ascii_lowercase(), driver);
    info!(scheme, "registered document store driver");
    Ok(())
}

/// Schemes that currently have a driver.
pub fn registered_schemes() -> Result<Vec<String>, CoreError> {
    let drivers = DRIVERS.read().map_err(|_| poisoned("driver registry"))?;
    let mut schemes: Vec<String> = drivers.keys().cloned().collect();
    schemes.sort();
    Ok(schemes)
}

fn driver_for(scheme: &str) -> Result<Arc<dyn Driver>, CoreError> {
    let drivers = DRIVERS.read().map_err(|_| poisoned("driver registry"))?;
    drivers.get(scheme).cloned().ok_or_else(|| {
        CoreError::connection(
            "error while initializing connection",
            format!("no driver registered for scheme '{}'", scheme),
        )
    })
}

/// An open connection to one logical database.
#[derive(Clone)]
pub struct Connection {
    uri: ConnectionUri,
    database: Arc<dyn Database>,
}

impl Connection {
    /// Open a connection through the driver registered for the URI scheme.
    /// Failures are wrapped in `CoreError::Connection`.
    pub fn open(uri: &ConnectionUri) -> Result<Self, CoreError> {
        let driver = driver_for(uri.scheme())?;
        let database = driver.connect(uri).map_err(|e| match e {
            CoreError::Connection { .. } => e,
            other => CoreError::connection(
                format!("error while initializing connection with {}", uri),
                other,
            ),
        })?;
        info!(uri = %uri, database = database.name(), "opened connection");
        Ok(Self {
            uri: uri.clone(),
            database,
        })
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    /// Derive a model named `name` over the schema's collection.
    pub fn model(&self, name: &str, schema: Schema) -> Result<Model, CoreError> {
        let store = self.database.collection(schema.collection())?;
        Ok(Model::new(name, schema, store))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("database", &self.database.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_components() {
        let uri = ConnectionUri::parse("MemDB://127.0.0.1:27017/app?retry=true").unwrap();
        assert_eq!(uri.scheme(), "memdb");
        assert_eq!(uri.authority(), "127.0.0.1:27017");
        assert_eq!(uri.database(), Some("app"));
        assert_eq!(uri.query(), Some("retry=true"));
        assert_eq!(uri.to_string(), "memdb://127.0.0.1:27017/app?retry=true");
    }

    #[test]
    fn with_database_rewrites_path_only() {
        let base = ConnectionUri::parse("sqlite://local/ignored/deeper?mode=rwc").unwrap();
        let uri = base.with_database("orders");
        assert_eq!(uri.to_string(), "sqlite://local/orders?mode=rwc");

        let bare = ConnectionUri::parse("memdb://host:1").unwrap();
        assert_eq!(bare.database(), None);
        assert_eq!(bare.with_database("x").database(), Some("x"));
    }

    #[test]
    fn parse_rejects_malformed() {
        for raw in ["", "no-scheme", "://host/db", "bad scheme://h/db", "memdb:///db"] {
            let err = ConnectionUri::parse(raw).unwrap_err();
            assert!(err.is_connection(), "{raw} should fail as connection error");
        }
    }

    #[test]
    fn unknown_scheme_fails_to_open() {
        let uri = ConnectionUri::parse("nosuch://h/db").unwrap();
        let err = Connection::open(&uri).unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("nosuch"));
    }

    #[test]
    fn memory_scheme_is_always_registered() {
        assert!(registered_schemes().unwrap().contains(&MEMORY_SCHEME.to_string()));
    }
}
