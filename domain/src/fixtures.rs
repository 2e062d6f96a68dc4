//! Fixture registry: loads fixture documents, inserts them into ephemeral
//! instances on demand, and tears those instances down again.
//!
//! Fixtures live in a three-level tree (database, collection, id). Each entry
//! moves `Loaded -> Pending -> Inserted` and is removed by `clean`. The tree
//! enforces the invariants centrally: ids are unique per collection, and an
//! entry that is pending or inserted cannot be inserted again.
//!
//! An `insert` batch is all-or-nothing. If any branch fails, the instances
//! the other branches provisioned are stopped and their entries go back to
//! `Loaded` before the first error is returned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::memory_server::MemoryServer;
use crate::driver::ConnectionUri;
use crate::ephemeral::{MemoryModel, MemoryModelSpec};
use crate::model::{Model, Record};
use crate::models::SchemaRegistry;
use crate::{
    poisoned, CoreError, DescriptorProvider, Document, FixtureDoc, FixtureSource, SchemaDefinition,
};

/// Location of one fixture in the tree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixtureKey {
    pub db_name: String,
    pub collection_name: String,
    pub id: String,
}

/// A fixture after insertion into its own ephemeral instance.
#[derive(Debug)]
pub struct InsertedFixture {
    pub name: String,
    pub doc_contents: Document,
    /// Live record as read back after the insert.
    pub doc: Record,
    pub doc_lean: Document,
    pub doc_to_object: Document,
    pub model: Model,
    /// Lifecycle handle of the instance holding this fixture.
    pub server: Arc<MemoryServer>,
    pub connection_uri: ConnectionUri,
}

impl InsertedFixture {
    pub fn fixture_doc(&self) -> FixtureDoc {
        FixtureDoc {
            name: self.name.clone(),
            doc_contents: self.doc_contents.clone(),
        }
    }

    pub fn stop(&self) -> Result<(), CoreError> {
        self.server.stop()
    }
}

/// A fixture as returned by `get_fixture`.
#[derive(Clone, Debug)]
pub enum Fixture {
    Loaded(FixtureDoc),
    Inserted(Arc<InsertedFixture>),
}

impl Fixture {
    pub fn name(&self) -> &str {
        match self {
            Fixture::Loaded(doc) => &doc.name,
            Fixture::Inserted(f) => &f.name,
        }
    }

    pub fn doc_contents(&self) -> &Document {
        match self {
            Fixture::Loaded(doc) => &doc.doc_contents,
            Fixture::Inserted(f) => &f.doc_contents,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Fixture::Inserted(_))
    }

    pub fn as_inserted(&self) -> Option<&Arc<InsertedFixture>> {
        match self {
            Fixture::Inserted(f) => Some(f),
            Fixture::Loaded(_) => None,
        }
    }
}

enum Entry {
    Loaded(FixtureDoc),
    Pending(FixtureDoc),
    Inserted(Arc<InsertedFixture>),
}

impl Entry {
    fn to_fixture(&self) -> Fixture {
        match self {
            Entry::Loaded(doc) | Entry::Pending(doc) => Fixture::Loaded(doc.clone()),
            Entry::Inserted(f) => Fixture::Inserted(Arc::clone(f)),
        }
    }

    fn fixture_doc(&self) -> FixtureDoc {
        match self {
            Entry::Loaded(doc) | Entry::Pending(doc) => doc.clone(),
            Entry::Inserted(f) => f.fixture_doc(),
        }
    }
}

type Collections = BTreeMap<String, BTreeMap<String, Entry>>;

#[derive(Default)]
struct FixtureTree {
    databases: BTreeMap<String, Collections>,
}

impl FixtureTree {
    fn load(&mut self, source: FixtureSource) -> Result<(), CoreError> {
        let id = source.fixture.id()?;
        let fixtures = self
            .databases
            .entry(source.db_name.clone())
            .or_default()
            .entry(source.collection_name.clone())
            .or_default();
        if let Some(existing) = fixtures.get(&id) {
            return Err(CoreError::validation(
                format!("duplicated fixture id: {}", id),
                json!({
                    "id": id,
                    "dbName": source.db_name,
                    "collectionName": source.collection_name,
                    "existing": existing.fixture_doc(),
                    "duplicate": source.fixture,
                }),
            ));
        }
        fixtures.insert(id, Entry::Loaded(source.fixture));
        Ok(())
    }

    fn entries(&self) -> impl Iterator<Item = (FixtureKey, &Entry)> {
        self.databases.iter().flat_map(|(db, collections)| {
            collections.iter().flat_map(move |(coll, fixtures)| {
                fixtures.iter().map(move |(id, entry)| {
                    (
                        FixtureKey {
                            db_name: db.clone(),
                            collection_name: coll.clone(),
                            id: id.clone(),
                        },
                        entry,
                    )
                })
            })
        })
    }

    fn locate(&self, id: &str) -> Vec<(FixtureKey, &Entry)> {
        self.entries().filter(|(key, _)| key.id == id).collect()
    }

    fn get_mut(&mut self, key: &FixtureKey) -> Option<&mut Entry> {
        self.databases
            .get_mut(&key.db_name)?
            .get_mut(&key.collection_name)?
            .get_mut(&key.id)
    }

    /// Move every location of the requested ids to `Pending`. Fails without
    /// touching anything if one of them is pending or inserted already.
    fn reserve(&mut self, ids: &[String]) -> Result<Vec<(FixtureKey, FixtureDoc)>, CoreError> {
        let mut reserved = Vec::new();
        for id in ids {
            for (key, entry) in self.locate(id) {
                match entry {
                    Entry::Loaded(doc) => reserved.push((key, doc.clone())),
                    Entry::Pending(_) | Entry::Inserted(_) => {
                        return Err(CoreError::validation(
                            format!("fixture already inserted: {}", id),
                            json!({
                                "fixture": entry.fixture_doc(),
                                "id": id,
                                "dbName": key.db_name,
                                "collectionName": key.collection_name,
                            }),
                        ));
                    }
                }
            }
        }
        for (key, doc) in &reserved {
            if let Some(entry) = self.get_mut(key) {
                *entry = Entry::Pending(doc.clone());
            }
        }
        Ok(reserved)
    }

    /// Put pending entries back to `Loaded`.
    fn release(&mut self, keys: &[FixtureKey]) {
        for key in keys {
            if let Some(entry) = self.get_mut(key) {
                if let Entry::Pending(doc) = entry {
                    let doc = std::mem::take(doc);
                    *entry = Entry::Loaded(doc);
                }
            }
        }
    }

    /// Turn a pending entry into an inserted one. False if the entry was
    /// cleaned while the insert was in flight.
    fn complete(&mut self, key: &FixtureKey, fixture: Arc<InsertedFixture>) -> bool {
        match self.get_mut(key) {
            Some(entry) if matches!(entry, Entry::Pending(_)) => {
                *entry = Entry::Inserted(fixture);
                true
            }
            _ => false,
        }
    }

    /// Remove every location of `id`, pruning emptied branches.
    fn remove(&mut self, id: &str) -> Vec<Entry> {
        let mut removed = Vec::new();
        for collections in self.databases.values_mut() {
            for fixtures in collections.values_mut() {
                if let Some(entry) = fixtures.remove(id) {
                    removed.push(entry);
                }
            }
            collections.retain(|_, fixtures| !fixtures.is_empty());
        }
        self.databases.retain(|_, collections| !collections.is_empty());
        removed
    }

    fn into_entries(self) -> Vec<Entry> {
        self.databases
            .into_values()
            .flat_map(|collections| collections.into_values())
            .flat_map(|fixtures| fixtures.into_values())
            .collect()
    }
}

/// Registry of fixtures, backed by the schema registry for collection
/// schemas.
pub struct FixtureRegistry {
    models: Arc<SchemaRegistry>,
    tree: Mutex<FixtureTree>,
}

impl FixtureRegistry {
    pub fn load(
        provider: &dyn DescriptorProvider<FixtureSource>,
        models: Arc<SchemaRegistry>,
    ) -> Result<Self, CoreError> {
        Self::from_sources(provider.descriptors()?, models)
    }

    /// Build the tree from already discovered fixtures.
    pub fn from_sources(
        sources: Vec<FixtureSource>,
        models: Arc<SchemaRegistry>,
    ) -> Result<Self, CoreError> {
        let mut tree = FixtureTree::default();
        let count = sources.len();
        for source in sources {
            tree.load(source)?;
        }
        info!(count, "loaded fixtures");
        Ok(Self {
            models,
            tree: Mutex::new(tree),
        })
    }

    pub fn models(&self) -> &Arc<SchemaRegistry> {
        &self.models
    }

    fn tree(&self) -> Result<MutexGuard<'_, FixtureTree>, CoreError> {
        self.tree.lock().map_err(|_| poisoned("fixture registry"))
    }

    /// Insert the requested fixtures, each into its own ephemeral instance.
    pub async fn insert(
        &self,
        ids: &[&str],
    ) -> Result<BTreeMap<String, Arc<InsertedFixture>>, CoreError> {
        let mut seen = BTreeSet::new();
        let requested: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| id.to_string())
            .collect();

        let reserved = self.tree()?.reserve(&requested)?;
        if reserved.is_empty() {
            return Err(no_fixtures_inserted(&requested));
        }
        let reservation = Reservation {
            tree: &self.tree,
            keys: reserved.iter().map(|(key, _)| key.clone()).collect(),
        };

        let mut jobs = Vec::with_capacity(reserved.len());
        for (key, doc) in reserved {
            let handle = self.models.model(&key.collection_name)?;
            jobs.push((key, doc, handle.descriptor.schema));
        }

        // Dropping this future drops the set; branches still running finish
        // on their own and their servers stop when the result is discarded.
        let mut tasks = JoinSet::new();
        for (key, doc, schema) in jobs {
            tasks.spawn_blocking(move || {
                let result = materialize(&key, doc, schema);
                (key, result)
            });
        }

        let mut inserted = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(fixture))) => inserted.push((key, Arc::new(fixture))),
                Ok((_, Err(e))) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(CoreError::Repository(format!(
                        "fixture insert task failed: {}",
                        e
                    )));
                }
            }
        }

        if let Some(err) = failure {
            let servers = inserted.into_iter().map(|(_, f)| f).collect();
            if let Err(stop_err) = stop_all(servers).await {
                warn!(error = %stop_err, "failed to roll back fixture batch");
            }
            return Err(err);
        }

        inserted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut result = BTreeMap::new();
        let mut orphaned = Vec::new();
        {
            let mut tree = self.tree()?;
            for (key, fixture) in inserted {
                if tree.complete(&key, Arc::clone(&fixture)) {
                    debug!(id = %key.id, db = %key.db_name, collection = %key.collection_name, "fixture inserted");
                    result.entry(key.id).or_insert(fixture);
                } else {
                    orphaned.push(fixture);
                }
            }
        }
        reservation.commit();

        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "fixtures cleaned while being inserted");
            stop_all(orphaned).await?;
        }

        if result.is_empty() {
            return Err(no_fixtures_inserted(&requested));
        }
        Ok(result)
    }

    /// First fixture with this id, in database then collection order.
    pub fn get_fixture(&self, id: &str) -> Result<Fixture, CoreError> {
        let tree = self.tree()?;
        let found = tree
            .entries()
            .find(|(key, _)| key.id == id)
            .map(|(_, entry)| entry.to_fixture());
        found.ok_or_else(|| {
            CoreError::not_found(format!("fixture not found: {}", id), json!({ "id": id }))
        })
    }

    /// Remove the given ids, stopping the instances of inserted ones.
    pub async fn clean(&self, ids: &[&str]) -> Result<(), CoreError> {
        let removed: Vec<Entry> = {
            let mut tree = self.tree()?;
            ids.iter().flat_map(|id| tree.remove(id)).collect()
        };
        debug!(count = removed.len(), "cleaning fixtures");
        stop_all(inserted_only(removed)).await
    }

    /// Stop every inserted fixture's instance and empty the registry.
    pub async fn clean_all(&self) -> Result<(), CoreError> {
        let tree = std::mem::take(&mut *self.tree()?);
        let inserted = inserted_only(tree.into_entries());
        info!(count = inserted.len(), "cleaning all fixtures");
        stop_all(inserted).await
    }

    /// Number of fixtures in the tree.
    pub fn len(&self) -> Result<usize, CoreError> {
        Ok(self.tree()?.entries().count())
    }

    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.len()? == 0)
    }

    /// Distinct fixture ids, sorted.
    pub fn ids(&self) -> Result<Vec<String>, CoreError> {
        let ids: BTreeSet<String> = self.tree()?.entries().map(|(key, _)| key.id).collect();
        Ok(ids.into_iter().collect())
    }

    /// Every key in the tree, in order.
    pub fn keys(&self) -> Result<Vec<FixtureKey>, CoreError> {
        Ok(self.tree()?.entries().map(|(key, _)| key).collect())
    }
}

/// Reserved keys of one `insert` call. Entries still pending when this is
/// dropped go back to `Loaded`, including when the call itself is dropped.
struct Reservation<'a> {
    tree: &'a Mutex<FixtureTree>,
    keys: Vec<FixtureKey>,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.keys.clear();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        match self.tree.lock() {
            Ok(mut tree) => tree.release(&self.keys),
            Err(_) => warn!(count = self.keys.len(), "fixture registry poisoned; reservations kept"),
        }
    }
}

fn no_fixtures_inserted(ids: &[String]) -> CoreError {
    CoreError::not_found("no fixtures inserted", json!({ "ids": ids }))
}

fn inserted_only(entries: Vec<Entry>) -> Vec<Arc<InsertedFixture>> {
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            Entry::Inserted(f) => Some(f),
            Entry::Loaded(_) | Entry::Pending(_) => None,
        })
        .collect()
}

/// Stop every instance concurrently. All stops are attempted; the first
/// failure is returned.
async fn stop_all(fixtures: Vec<Arc<InsertedFixture>>) -> Result<(), CoreError> {
    let mut tasks = JoinSet::new();
    for fixture in fixtures {
        tasks.spawn_blocking(move || fixture.stop());
    }
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| CoreError::Repository(format!("fixture stop task failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = result {
            failure.get_or_insert(e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// One insert branch: provision, write, read back.
fn materialize(
    key: &FixtureKey,
    doc: FixtureDoc,
    schema: SchemaDefinition,
) -> Result<InsertedFixture, CoreError> {
    let memory = MemoryModel::create(MemoryModelSpec {
        db_name: key.db_name.clone(),
        schema,
        model_name: key.collection_name.clone(),
    })?;

    let read_back = || -> Result<(Document, Record), CoreError> {
        memory.model.create(doc.doc_contents.clone())?;
        let lean = memory.model.find_by_id_lean(&key.id)?;
        let record = memory.model.find_by_id(&key.id)?;
        match (lean, record) {
            (Some(lean), Some(record)) => Ok((lean, record)),
            _ => Err(CoreError::not_found(
                format!("fixture not found: {}", key.id),
                json!({ "id": key.id }),
            )),
        }
    };
    let (doc_lean, record) = match read_back() {
        Ok(found) => found,
        Err(e) => {
            if let Err(stop_err) = memory.server.stop() {
                warn!(error = %stop_err, "failed to stop instance after insert error");
            }
            return Err(e);
        }
    };

    Ok(InsertedFixture {
        name: doc.name,
        doc_contents: doc.doc_contents,
        doc_to_object: record.to_object(),
        doc: record,
        doc_lean,
        model: memory.model,
        server: memory.server,
        connection_uri: memory.uri,
    })
}
