//! In-memory document store.
//!
//! Implements the driver traits over process-local state. Documents keep
//! insertion order, unique indexes are enforced on every write and sessions
//! support transactions by staging a private copy of each collection they
//! touch. A commit re-applies the recorded per-document changes to the live
//! data and re-checks unique indexes, publishing nothing on a conflict.

mod bucket;
pub mod matcher;

use crate::config::ClientConfig;
use crate::core::{Document, ObjectId, OdmError, Result};
use crate::index::{IndexDirection, IndexSpec};
use crate::store::{
    DeleteResult, FindOptions, ID_FIELD, IndexInfo, InsertOneResult, StoreBucket, StoreClient,
    StoreCollection, StoreCursor, StoreDatabase, StoreSession, UpdateResult,
};
use async_trait::async_trait;
use bucket::BucketData;
use matcher::{apply_update, compare_by, matches, validate_replacement, values_equal};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::debug;

pub use bucket::MemoryBucket;

const ID_INDEX_NAME: &str = "_id_";
const INDEX_VERSION: i32 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Collection data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct IndexEntry {
    name: String,
    keys: Vec<(String, IndexDirection)>,
    unique: bool,
    sparse: bool,
    options: BTreeMap<String, Value>,
}

impl IndexEntry {
    fn from_spec(spec: &IndexSpec) -> Self {
        let options = spec
            .options()
            .iter()
            .filter(|(name, _)| name.as_str() != "name")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            name: spec.index_name(),
            keys: spec.keys().fields(),
            unique: spec.is_unique(),
            sparse: spec.is_sparse(),
            options,
        }
    }

    /// Key tuple of `doc` under this index, or `None` if a sparse index skips it.
    fn key_of(&self, doc: &Document) -> Option<Vec<Value>> {
        let values: Vec<Option<&Value>> = self
            .keys
            .iter()
            .map(|(field, _)| crate::core::document::get_path(doc, field))
            .collect();
        if self.sparse && values.iter().all(Option::is_none) {
            return None;
        }
        Some(
            values
                .into_iter()
                .map(|v| v.cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn info(&self) -> IndexInfo {
        IndexInfo {
            key: self
                .keys
                .iter()
                .map(|(field, dir)| (field.clone(), dir.as_i32()))
                .collect(),
            unique: self.unique,
            options: self
                .options
                .iter()
                .filter(|(name, _)| name.as_str() != "unique")
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            v: INDEX_VERSION,
        }
    }
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

#[derive(Debug, Clone, Default)]
struct CollectionData {
    docs: Vec<Document>,
    indexes: Vec<IndexEntry>,
}

impl CollectionData {
    fn positions(&self, filter: &Document) -> Result<Vec<usize>> {
        let mut found = Vec::new();
        for (pos, doc) in self.docs.iter().enumerate() {
            if matches(doc, filter)? {
                found.push(pos);
            }
        }
        Ok(found)
    }

    fn first_position(&self, filter: &Document) -> Result<Option<usize>> {
        for (pos, doc) in self.docs.iter().enumerate() {
            if matches(doc, filter)? {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }

    /// Check `candidate` against every other document, skipping `ignore`.
    fn check_unique(&self, collection: &str, candidate: &Document, ignore: Option<usize>) -> Result<()> {
        let others = self
            .docs
            .iter()
            .enumerate()
            .filter(|(pos, _)| Some(*pos) != ignore)
            .map(|(_, doc)| doc);

        for other in others {
            if let (Some(a), Some(b)) = (candidate.get(ID_FIELD), other.get(ID_FIELD))
                && values_equal(a, b)
            {
                return Err(duplicate(collection, ID_INDEX_NAME, a));
            }
            for index in self.indexes.iter().filter(|i| i.unique) {
                if let (Some(a), Some(b)) = (index.key_of(candidate), index.key_of(other))
                    && keys_equal(&a, &b)
                {
                    return Err(duplicate(collection, &index.name, &Value::Array(a)));
                }
            }
        }
        Ok(())
    }

    /// Check a whole document set against one index.
    fn check_index(collection: &str, index: &IndexEntry, docs: &[Document]) -> Result<()> {
        if !index.unique {
            return Ok(());
        }
        let mut seen: Vec<Vec<Value>> = Vec::new();
        for doc in docs {
            if let Some(key) = index.key_of(doc) {
                if seen.iter().any(|k| keys_equal(k, &key)) {
                    return Err(duplicate(collection, &index.name, &Value::Array(key)));
                }
                seen.push(key);
            }
        }
        Ok(())
    }

    fn check_all(&self, collection: &str, docs: &[Document]) -> Result<()> {
        let id_index = IndexEntry {
            name: ID_INDEX_NAME.to_string(),
            keys: vec![(ID_FIELD.to_string(), IndexDirection::Ascending)],
            unique: true,
            sparse: false,
            options: BTreeMap::new(),
        };
        Self::check_index(collection, &id_index, docs)?;
        for index in &self.indexes {
            Self::check_index(collection, index, docs)?;
        }
        Ok(())
    }

    fn insert(&mut self, collection: &str, mut doc: Document) -> Result<ObjectId> {
        let id = match doc.get(ID_FIELD) {
            None => ObjectId::new(),
            Some(value) => ObjectId::from_value(value)?,
        };
        doc.insert(ID_FIELD.to_string(), id.to_native());

        self.check_unique(collection, &doc, None)?;
        self.docs.push(doc);
        Ok(id)
    }

    fn replace_one(&mut self, collection: &str, filter: &Document, mut replacement: Document) -> Result<UpdateResult> {
        validate_replacement(&replacement)?;
        let Some(pos) = self.first_position(filter)? else {
            return Ok(UpdateResult::default());
        };

        let current_id = self.docs[pos].get(ID_FIELD).cloned().unwrap_or(Value::Null);
        if let Some(new_id) = replacement.get(ID_FIELD)
            && !values_equal(new_id, &current_id)
        {
            return Err(OdmError::InvalidOperation(
                "the identity field is immutable".into(),
            ));
        }
        replacement.insert(ID_FIELD.to_string(), current_id);

        self.check_unique(collection, &replacement, Some(pos))?;
        let modified = self.docs[pos] != replacement;
        self.docs[pos] = replacement;
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: modified as u64,
        })
    }

    fn update(&mut self, collection: &str, filter: &Document, update: &Document, multi: bool) -> Result<UpdateResult> {
        let positions = if multi {
            self.positions(filter)?
        } else {
            self.first_position(filter)?.into_iter().collect()
        };

        // Work on a copy so a failing operator or unique check leaves the data untouched.
        let mut docs = self.docs.clone();
        let mut modified = 0;
        for &pos in &positions {
            if apply_update(&mut docs[pos], update)? {
                modified += 1;
            }
        }
        if modified > 0 {
            self.check_all(collection, &docs)?;
            self.docs = docs;
        }

        Ok(UpdateResult {
            matched_count: positions.len() as u64,
            modified_count: modified,
        })
    }

    fn delete(&mut self, filter: &Document, multi: bool) -> Result<DeleteResult> {
        let positions: HashSet<usize> = if multi {
            self.positions(filter)?.into_iter().collect()
        } else {
            self.first_position(filter)?.into_iter().collect()
        };
        if positions.is_empty() {
            return Ok(DeleteResult::default());
        }

        let mut pos = 0;
        self.docs.retain(|_| {
            let keep = !positions.contains(&pos);
            pos += 1;
            keep
        });
        Ok(DeleteResult {
            deleted_count: positions.len() as u64,
        })
    }

    /// Re-apply a committed change to the live documents.
    ///
    /// Updates and removals of documents that are gone by now match nothing.
    fn apply(&mut self, change: Change) {
        let position_of = |docs: &[Document], id: &Value| {
            docs.iter()
                .position(|doc| doc.get(ID_FIELD).is_some_and(|v| values_equal(v, id)))
        };
        match change {
            Change::Insert(doc) => self.docs.push(doc),
            Change::Update(doc) => {
                let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
                if let Some(pos) = position_of(&self.docs, &id) {
                    self.docs[pos] = doc;
                }
            }
            Change::Remove(id) => {
                if let Some(pos) = position_of(&self.docs, &id) {
                    self.docs.remove(pos);
                }
            }
        }
    }

    fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        let mut found: Vec<&Document> = Vec::new();
        for doc in &self.docs {
            if matches(doc, filter)? {
                found.push(doc);
            }
        }
        if !options.sort.is_empty() {
            found.sort_by(|a, b| compare_by(a, b, &options.sort));
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(found.into_iter().skip(skip).take(limit).cloned().collect())
    }

    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> Result<String> {
        let entry = IndexEntry::from_spec(spec);
        if entry.keys.is_empty() || entry.keys.iter().any(|(field, _)| field.is_empty()) {
            return Err(OdmError::InvalidOperation(format!(
                "index '{}' has an empty key pattern",
                entry.name
            )));
        }
        if entry.name == ID_INDEX_NAME {
            return Ok(entry.name);
        }

        if let Some(existing) = self.indexes.iter().find(|i| i.name == entry.name) {
            if *existing == entry {
                return Ok(entry.name);
            }
            return Err(OdmError::InvalidOperation(format!(
                "index '{}' already exists with different options",
                entry.name
            )));
        }

        Self::check_index(collection, &entry, &self.docs)?;
        let name = entry.name.clone();
        self.indexes.push(entry);
        Ok(name)
    }

    fn index_information(&self) -> BTreeMap<String, IndexInfo> {
        let mut info = BTreeMap::new();
        info.insert(
            ID_INDEX_NAME.to_string(),
            IndexInfo {
                key: vec![(ID_FIELD.to_string(), 1)],
                unique: false,
                options: BTreeMap::new(),
                v: INDEX_VERSION,
            },
        );
        for index in &self.indexes {
            info.insert(index.name.clone(), index.info());
        }
        info
    }
}

fn duplicate(collection: &str, index: &str, key: &Value) -> OdmError {
    OdmError::DuplicateKey {
        collection: collection.to_string(),
        index: index.to_string(),
        key: key.to_string(),
    }
}

// ============================================================================
// Client and database
// ============================================================================

struct DatabaseState {
    name: String,
    collections: RwLock<BTreeMap<String, CollectionData>>,
    buckets: Mutex<HashMap<String, Arc<BucketData>>>,
}

impl DatabaseState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: RwLock::new(BTreeMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn snapshot(&self, collection: &str) -> CollectionData {
        let collections = self.collections.read().await;
        collections.get(collection).cloned().unwrap_or_default()
    }
}

struct ClientInner {
    config: ClientConfig,
    databases: Mutex<HashMap<String, Arc<DatabaseState>>>,
    next_session_id: AtomicU64,
}

impl ClientInner {
    fn database_state(&self, name: &str) -> Arc<DatabaseState> {
        let mut databases = lock(&self.databases);
        databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DatabaseState::new(name)))
            .clone()
    }
}

/// Client for the in-memory store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<ClientInner>,
}

impl MemoryClient {
    pub fn new(config: ClientConfig) -> Self {
        debug!(
            app_name = config.app_name.as_deref().unwrap_or("-"),
            connect_timeout = ?config.connect_timeout,
            server_selection_timeout = ?config.server_selection_timeout,
            "in-memory client created"
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                databases: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn database_names(&self) -> Vec<String> {
        let databases = lock(&self.inner.databases);
        let mut names: Vec<String> = databases.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn StoreDatabase> {
        Arc::new(MemoryDatabase {
            state: self.inner.database_state(name),
        })
    }

    fn default_database(&self) -> Option<String> {
        self.inner.config.database.clone()
    }

    async fn start_session(&self) -> Result<Arc<dyn StoreSession>> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "session started");
        Ok(Arc::new(MemorySession {
            id,
            client: self.inner.clone(),
            state: Mutex::new(SessionState::default()),
        }))
    }
}

pub struct MemoryDatabase {
    state: Arc<DatabaseState>,
}

#[async_trait]
impl StoreDatabase for MemoryDatabase {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn collection(&self, name: &str) -> Arc<dyn StoreCollection> {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            db: self.state.clone(),
        })
    }

    fn bucket(&self, name: &str) -> Arc<dyn StoreBucket> {
        let data = {
            let mut buckets = lock(&self.state.buckets);
            buckets.entry(name.to_string()).or_default().clone()
        };
        Arc::new(MemoryBucket::new(name, data))
    }

    async fn list_collection_names(&self) -> Result<Vec<String>> {
        let collections = self.state.collections.read().await;
        Ok(collections.keys().cloned().collect())
    }
}

// ============================================================================
// Sessions
// ============================================================================

type CollectionKey = (String, String);

/// Effect of a transactional write on one document, keyed by `_id`.
#[derive(Debug, Clone)]
enum Change {
    Insert(Document),
    Update(Document),
    Remove(Value),
}

impl Change {
    /// Document-level effects turning `before` into `after`, in document order.
    fn between(before: &[Document], after: &[Document]) -> Vec<Change> {
        let id_key = |doc: &Document| doc.get(ID_FIELD).map(Value::to_string);
        let old: HashMap<String, &Document> = before
            .iter()
            .filter_map(|doc| Some((id_key(doc)?, doc)))
            .collect();
        let kept: HashSet<String> = after.iter().filter_map(id_key).collect();

        let mut changes = Vec::new();
        for doc in after {
            match id_key(doc).and_then(|key| old.get(&key).copied()) {
                None => changes.push(Change::Insert(doc.clone())),
                Some(previous) if previous != doc => changes.push(Change::Update(doc.clone())),
                Some(_) => {}
            }
        }
        for doc in before {
            if let (Some(key), Some(id)) = (id_key(doc), doc.get(ID_FIELD))
                && !kept.contains(&key)
            {
                changes.push(Change::Remove(id.clone()));
            }
        }
        changes
    }
}

#[derive(Default)]
struct Staged {
    collections: HashMap<CollectionKey, CollectionData>,
    changes: Vec<(CollectionKey, Change)>,
}

#[derive(Default)]
struct SessionState {
    ended: bool,
    transaction: Option<Staged>,
}

pub struct MemorySession {
    id: u64,
    client: Arc<ClientInner>,
    state: Mutex<SessionState>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if lock(&self.state).ended {
            return Err(OdmError::Transaction(format!(
                "session {} has already ended",
                self.id
            )));
        }
        Ok(())
    }

    fn is_staged(&self, key: &CollectionKey) -> bool {
        lock(&self.state)
            .transaction
            .as_ref()
            .is_some_and(|staged| staged.collections.contains_key(key))
    }

    fn stage(&self, key: CollectionKey, data: CollectionData) {
        if let Some(staged) = lock(&self.state).transaction.as_mut() {
            staged.collections.entry(key).or_insert(data);
        }
    }

    fn with_staged<R>(
        &self,
        key: &CollectionKey,
        write: bool,
        f: impl FnOnce(&mut CollectionData) -> Result<R>,
    ) -> Result<R> {
        let mut state = lock(&self.state);
        let staged = state.transaction.as_mut().ok_or_else(|| {
            OdmError::Transaction(format!("session {} has no open transaction", self.id))
        })?;
        let data = staged.collections.entry(key.clone()).or_default();
        if !write {
            return f(data);
        }
        let before = data.docs.clone();
        let result = f(data)?;
        let changes = Change::between(&before, &data.docs);
        staged
            .changes
            .extend(changes.into_iter().map(|change| (key.clone(), change)));
        Ok(result)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn in_transaction(&self) -> bool {
        lock(&self.state).transaction.is_some()
    }

    async fn start_transaction(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.ended {
            return Err(OdmError::Transaction(format!(
                "session {} has already ended",
                self.id
            )));
        }
        if state.transaction.is_some() {
            return Err(OdmError::Transaction(format!(
                "transaction already in progress on session {}",
                self.id
            )));
        }
        state.transaction = Some(Staged::default());
        debug!(session = self.id, "transaction started");
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let staged = lock(&self.state).transaction.take().ok_or_else(|| {
            OdmError::Transaction(format!("no transaction to commit on session {}", self.id))
        })?;

        let mut by_database: BTreeMap<String, Vec<(String, Change)>> = BTreeMap::new();
        for ((db_name, collection), change) in staged.changes {
            by_database
                .entry(db_name)
                .or_default()
                .push((collection, change));
        }
        let states: Vec<Arc<DatabaseState>> = by_database
            .keys()
            .map(|name| self.client.database_state(name))
            .collect();

        // Locks are taken in database name order and held until every change is published.
        let mut guards = Vec::with_capacity(states.len());
        for state in &states {
            guards.push(state.collections.write().await);
        }

        let mut merged: Vec<BTreeMap<String, CollectionData>> = Vec::with_capacity(states.len());
        for (live, changes) in guards.iter().zip(by_database.into_values()) {
            let mut touched: BTreeMap<String, CollectionData> = BTreeMap::new();
            for (collection, change) in changes {
                touched
                    .entry(collection.clone())
                    .or_insert_with(|| live.get(&collection).cloned().unwrap_or_default())
                    .apply(change);
            }
            for (collection, data) in &touched {
                if let Err(err) = data.check_all(collection, &data.docs) {
                    debug!(session = self.id, %collection, error = %err, "commit rejected");
                    return Err(err);
                }
            }
            merged.push(touched);
        }

        for (live, touched) in guards.iter_mut().zip(merged) {
            for (collection, data) in touched {
                live.insert(collection, data);
            }
        }
        debug!(session = self.id, "transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        lock(&self.state).transaction.take().ok_or_else(|| {
            OdmError::Transaction(format!("no transaction to abort on session {}", self.id))
        })?;
        debug!(session = self.id, "transaction aborted");
        Ok(())
    }

    fn end_session(&self) {
        let mut state = lock(&self.state);
        if state.ended {
            return;
        }
        if state.transaction.take().is_some() {
            debug!(session = self.id, "open transaction aborted at session end");
        }
        state.ended = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resolve the session argument of a collection call to an open transaction, if any.
fn transaction_of<'a>(session: Option<&'a dyn StoreSession>) -> Result<Option<&'a MemorySession>> {
    let Some(session) = session else {
        return Ok(None);
    };
    let session = session
        .as_any()
        .downcast_ref::<MemorySession>()
        .ok_or_else(|| {
            OdmError::Transaction("session was not created by the in-memory store".into())
        })?;
    session.ensure_open()?;
    Ok(session.in_transaction().then_some(session))
}

// ============================================================================
// Collections
// ============================================================================

pub struct MemoryCollection {
    name: String,
    db: Arc<DatabaseState>,
}

impl MemoryCollection {
    fn key(&self) -> CollectionKey {
        (self.db.name.clone(), self.name.clone())
    }

    async fn read<R>(
        &self,
        session: Option<&dyn StoreSession>,
        f: impl FnOnce(&CollectionData) -> Result<R>,
    ) -> Result<R> {
        if let Some(tx) = transaction_of(session)? {
            let key = self.key();
            if !tx.is_staged(&key) {
                tx.stage(key.clone(), self.db.snapshot(&self.name).await);
            }
            return tx.with_staged(&key, false, |data| f(&*data));
        }

        let collections = self.db.collections.read().await;
        match collections.get(&self.name) {
            Some(data) => f(data),
            None => f(&CollectionData::default()),
        }
    }

    async fn write<R>(
        &self,
        session: Option<&dyn StoreSession>,
        f: impl FnOnce(&mut CollectionData) -> Result<R>,
    ) -> Result<R> {
        if let Some(tx) = transaction_of(session)? {
            let key = self.key();
            if !tx.is_staged(&key) {
                tx.stage(key.clone(), self.db.snapshot(&self.name).await);
            }
            return tx.with_staged(&key, true, f);
        }

        let mut collections = self.db.collections.write().await;
        let data = collections.entry(self.name.clone()).or_default();
        f(data)
    }
}

struct MemoryCursor {
    docs: VecDeque<Document>,
}

#[async_trait]
impl StoreCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        Ok(self.docs.pop_front())
    }
}

#[async_trait]
impl StoreCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_one(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<Option<Document>> {
        self.read(session, |data| {
            Ok(data
                .first_position(&filter)?
                .map(|pos| data.docs[pos].clone()))
        })
        .await
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        session: Option<&dyn StoreSession>,
    ) -> Result<Box<dyn StoreCursor>> {
        let docs = self.read(session, |data| data.find(&filter, &options)).await?;
        Ok(Box::new(MemoryCursor { docs: docs.into() }))
    }

    async fn count_documents(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<u64> {
        self.read(session, |data| Ok(data.positions(&filter)?.len() as u64))
            .await
    }

    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<InsertOneResult> {
        let name = self.name.clone();
        let inserted_id = self
            .write(session, |data| data.insert(&name, document))
            .await?;
        Ok(InsertOneResult { inserted_id })
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult> {
        let name = self.name.clone();
        self.write(session, |data| data.replace_one(&name, &filter, replacement))
            .await
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult> {
        let name = self.name.clone();
        self.write(session, |data| data.update(&name, &filter, &update, false))
            .await
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult> {
        let name = self.name.clone();
        self.write(session, |data| data.update(&name, &filter, &update, true))
            .await
    }

    async fn delete_one(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<DeleteResult> {
        self.write(session, |data| data.delete(&filter, false)).await
    }

    async fn delete_many(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<DeleteResult> {
        self.write(session, |data| data.delete(&filter, true)).await
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<String> {
        let mut collections = self.db.collections.write().await;
        let data = collections.entry(self.name.clone()).or_default();
        let name = data.create_index(&self.name, spec)?;
        debug!(collection = %self.name, index = %name, "index ensured");
        Ok(name)
    }

    async fn index_information(&self) -> Result<BTreeMap<String, IndexInfo>> {
        let collections = self.db.collections.read().await;
        Ok(collections
            .get(&self.name)
            .map(CollectionData::index_information)
            .unwrap_or_else(|| CollectionData::default().index_information()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::into_document;
    use crate::index::ASC;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    fn collection(name: &str) -> (MemoryClient, Arc<dyn StoreCollection>) {
        let client = MemoryClient::default();
        let coll = client.database("test").collection(name);
        (client, coll)
    }

    async fn drain(mut cursor: Box<dyn StoreCursor>) -> Vec<Document> {
        let mut out = Vec::new();
        while let Some(doc) = cursor.next().await.unwrap() {
            out.push(doc);
        }
        out
    }

    #[tokio::test]
    async fn test_insert_assigns_native_id() {
        let (_client, coll) = collection("people");
        let result = coll.insert_one(doc(json!({"name": "Ann"})), None).await.unwrap();

        let stored = coll
            .find_one(doc(json!({"_id": result.inserted_id.to_native()})), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("name"), Some(&json!("Ann")));
        assert!(ObjectId::is_native(&stored["_id"]));
    }

    #[tokio::test]
    async fn test_find_keeps_insertion_order_and_honours_options() {
        let (_client, coll) = collection("nums");
        for n in [3, 1, 2] {
            coll.insert_one(doc(json!({"n": n})), None).await.unwrap();
        }

        let all = drain(coll.find(Document::new(), FindOptions::new(), None).await.unwrap()).await;
        let order: Vec<_> = all.iter().map(|d| d["n"].clone()).collect();
        assert_eq!(order, vec![json!(3), json!(1), json!(2)]);

        let sorted = drain(
            coll.find(
                Document::new(),
                FindOptions::new().sort("n", ASC).skip(1).limit(1),
                None,
            )
            .await
            .unwrap(),
        )
        .await;
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let (_client, coll) = collection("users");
        coll.create_index(&IndexSpec::compound([("name", ASC)]).unique(true))
            .await
            .unwrap();

        coll.insert_one(doc(json!({"name": "Test"})), None).await.unwrap();
        let err = coll
            .insert_one(doc(json!({"name": "Test"})), None)
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_many_is_all_or_nothing_on_duplicates() {
        let (_client, coll) = collection("users");
        coll.create_index(&IndexSpec::new("name").unique(true)).await.unwrap();
        coll.insert_one(doc(json!({"name": "a", "g": 1})), None).await.unwrap();
        coll.insert_one(doc(json!({"name": "b", "g": 1})), None).await.unwrap();

        let err = coll
            .update_many(doc(json!({"g": 1})), doc(json!({"$set": {"name": "same"}})), None)
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(coll.count_documents(doc(json!({"name": "same"})), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_index_is_idempotent() {
        let (_client, coll) = collection("users");
        let spec = IndexSpec::compound([("name", ASC)]).unique(true);
        assert_eq!(coll.create_index(&spec).await.unwrap(), "name_1");
        assert_eq!(coll.create_index(&spec).await.unwrap(), "name_1");

        let conflicting = IndexSpec::compound([("name", ASC)]);
        assert!(coll.create_index(&conflicting).await.is_err());

        let info = coll.index_information().await.unwrap();
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({
                "_id_": {"key": [["_id", 1]], "v": 2},
                "name_1": {"key": [["name", 1]], "unique": true, "v": 2}
            })
        );
    }

    #[tokio::test]
    async fn test_create_index_fails_on_existing_duplicates() {
        let (_client, coll) = collection("users");
        coll.insert_one(doc(json!({"name": "x"})), None).await.unwrap();
        coll.insert_one(doc(json!({"name": "x"})), None).await.unwrap();
        let err = coll
            .create_index(&IndexSpec::new("name").unique(true))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let (_client, coll) = collection("items");
        let id = coll.insert_one(doc(json!({"a": 1})), None).await.unwrap().inserted_id;
        let filter = doc(json!({"_id": id.to_native()}));

        let replaced = coll
            .replace_one(filter.clone(), doc(json!({"b": 2})), None)
            .await
            .unwrap();
        assert_eq!(replaced.matched_count, 1);
        let stored = coll.find_one(filter.clone(), None).await.unwrap().unwrap();
        assert_eq!(stored.get("a"), None);
        assert_eq!(stored.get("b"), Some(&json!(2)));

        assert!(coll
            .replace_one(filter.clone(), doc(json!({"$set": {"b": 3}})), None)
            .await
            .is_err());

        let deleted = coll.delete_one(filter.clone(), None).await.unwrap();
        assert_eq!(deleted.deleted_count, 1);
        assert!(coll.find_one(filter, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_commit_publishes_writes() {
        let client = MemoryClient::default();
        let coll = client.database("test").collection("tx");
        let session = client.start_session().await.unwrap();
        session.start_transaction().await.unwrap();

        coll.insert_one(doc(json!({"n": 1})), Some(session.as_ref()))
            .await
            .unwrap();
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 0);
        assert_eq!(
            coll.count_documents(Document::new(), Some(session.as_ref()))
                .await
                .unwrap(),
            1
        );

        session.commit_transaction().await.unwrap();
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);
        session.end_session();
    }

    #[tokio::test]
    async fn test_transaction_abort_and_end_discard_writes() {
        let client = MemoryClient::default();
        let coll = client.database("test").collection("tx");

        let session = client.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        coll.insert_one(doc(json!({"n": 1})), Some(session.as_ref()))
            .await
            .unwrap();
        session.abort_transaction().await.unwrap();

        session.start_transaction().await.unwrap();
        coll.insert_one(doc(json!({"n": 2})), Some(session.as_ref()))
            .await
            .unwrap();
        session.end_session();

        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 0);
        assert!(coll
            .count_documents(Document::new(), Some(session.as_ref()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_session_state_errors() {
        let client = MemoryClient::default();
        let session = client.start_session().await.unwrap();
        assert!(session.commit_transaction().await.is_err());
        assert!(session.abort_transaction().await.is_err());
        session.start_transaction().await.unwrap();
        assert!(session.start_transaction().await.is_err());
        session.end_session();
        session.end_session();
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn test_databases_are_isolated_and_shared_across_clones() {
        let client = MemoryClient::default();
        let other = client.clone();
        client
            .database("a")
            .collection("c")
            .insert_one(doc(json!({"x": 1})), None)
            .await
            .unwrap();

        let a = other.database("a").collection("c");
        let b = other.database("b").collection("c");
        assert_eq!(a.count_documents(Document::new(), None).await.unwrap(), 1);
        assert_eq!(b.count_documents(Document::new(), None).await.unwrap(), 0);
        assert_eq!(
            other.database("a").list_collection_names().await.unwrap(),
            vec!["c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_commit_merges_with_writes_made_outside() {
        let client = MemoryClient::default();
        let coll = client.database("test").collection("merge");
        let kept = coll.insert_one(doc(json!({"n": 1})), None).await.unwrap().inserted_id;
        let gone = coll.insert_one(doc(json!({"n": 2})), None).await.unwrap().inserted_id;

        let session = client.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        let tx = Some(session.as_ref());
        coll.update_one(doc(json!({"_id": kept.to_native()})), doc(json!({"$set": {"n": 10}})), tx)
            .await
            .unwrap();
        coll.update_one(doc(json!({"_id": gone.to_native()})), doc(json!({"$set": {"n": 20}})), tx)
            .await
            .unwrap();
        coll.insert_one(doc(json!({"n": 3})), tx).await.unwrap();

        coll.delete_one(doc(json!({"_id": gone.to_native()})), None).await.unwrap();
        coll.insert_one(doc(json!({"n": 4})), None).await.unwrap();
        session.commit_transaction().await.unwrap();

        let all = drain(coll.find(Document::new(), FindOptions::new(), None).await.unwrap()).await;
        let order: Vec<_> = all.iter().map(|d| d["n"].clone()).collect();
        assert_eq!(order, vec![json!(10), json!(4), json!(3)]);
    }

    #[tokio::test]
    async fn test_commit_rechecks_unique_indexes() {
        let client = MemoryClient::default();
        let coll = client.database("test").collection("users");
        coll.create_index(&IndexSpec::new("name").unique(true)).await.unwrap();

        let first = client.start_session().await.unwrap();
        let second = client.start_session().await.unwrap();
        first.start_transaction().await.unwrap();
        second.start_transaction().await.unwrap();
        coll.insert_one(doc(json!({"name": "dup"})), Some(first.as_ref())).await.unwrap();
        coll.insert_one(doc(json!({"name": "dup", "n": 2})), Some(second.as_ref()))
            .await
            .unwrap();
        coll.insert_one(doc(json!({"name": "other"})), Some(second.as_ref()))
            .await
            .unwrap();

        first.commit_transaction().await.unwrap();
        let err = second.commit_transaction().await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(!second.in_transaction());

        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 1);
        assert_eq!(
            coll.count_documents(doc(json!({"name": "other"})), None).await.unwrap(),
            0
        );
    }

    struct ForeignSession;

    #[async_trait]
    impl StoreSession for ForeignSession {
        fn id(&self) -> u64 {
            0
        }

        fn in_transaction(&self) -> bool {
            false
        }

        async fn start_transaction(&self) -> Result<()> {
            Ok(())
        }

        async fn commit_transaction(&self) -> Result<()> {
            Ok(())
        }

        async fn abort_transaction(&self) -> Result<()> {
            Ok(())
        }

        fn end_session(&self) {}

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn test_foreign_session_is_rejected() {
        let (_client, coll) = collection("items");
        let err = coll
            .insert_one(doc(json!({"a": 1})), Some(&ForeignSession))
            .await
            .unwrap_err();
        assert!(matches!(err, OdmError::Transaction(_)));
        assert_eq!(coll.count_documents(Document::new(), None).await.unwrap(), 0);
    }

    #[test]
    fn test_client_keeps_its_config() {
        let config = ClientConfig::memory()
            .database("app")
            .app_name("reports")
            .connect_timeout(std::time::Duration::from_secs(3));
        let client = MemoryClient::new(config.clone());
        assert_eq!(client.config(), &config);
        assert_eq!(client.config().app_name.as_deref(), Some("reports"));
        assert_eq!(client.default_database().as_deref(), Some("app"));
    }
}
