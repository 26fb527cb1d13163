//! Typed entities on top of store collections.
//!
//! A type becomes persistable by implementing [`Model`]. Registering it with a
//! [`Database`](crate::Database) yields a [`ModelHandle`], which carries the
//! collection, the schema and optionally a transaction session, and exposes
//! every lifecycle operation. Values travel wrapped in [`Entity`], which
//! remembers the last persisted state so `save` only sends changed fields.

use crate::core::document::set_path;
use crate::core::{Document, ObjectId, OdmError, Result, into_document};
use crate::diff::diff;
use crate::index::{IndexKeys, IndexSpec};
use crate::schema::{DEFAULT_IDENTITY, Schema};
use crate::store::{FindOptions, ID_FIELD, IndexInfo, StoreCollection, StoreCursor, StoreSession};
use futures::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref COLLECTION_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap();
}

const MAX_COLLECTION_NAME: usize = 120;

/// A persistable document type.
///
/// The identity lives in an `id: Option<ObjectId>` field exposed through
/// [`Model::id`] and [`Model::set_id`]; it is stored as `_id`.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection override. Defaults to the lower-cased type name.
    const COLLECTION_NAME: Option<&'static str> = None;

    fn id(&self) -> Option<ObjectId>;

    fn set_id(&mut self, id: Option<ObjectId>);

    /// Indexes created when the registry is materialized.
    fn indexes() -> Vec<IndexSpec> {
        Vec::new()
    }

    fn schema() -> Schema {
        Schema::new()
    }

    /// Short type name used in logs and errors.
    fn model_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn collection_name() -> String {
        match Self::COLLECTION_NAME {
            Some(name) => name.to_string(),
            None => Self::model_name().to_lowercase(),
        }
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OdmError::InvalidModel("collection name cannot be empty".into()));
    }
    if !COLLECTION_NAME.is_match(name) || name.ends_with('.') || name.contains("..") {
        return Err(OdmError::InvalidModel(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    if name.starts_with("system.") {
        return Err(OdmError::InvalidModel(format!(
            "collection name '{}' uses the reserved 'system.' prefix",
            name
        )));
    }
    if name.len() > MAX_COLLECTION_NAME {
        return Err(OdmError::InvalidModel(format!(
            "collection name '{}' is too long (max {} characters)",
            name, MAX_COLLECTION_NAME
        )));
    }
    Ok(())
}

/// Check a model declaration before it is bound to a database.
pub(crate) fn validate_model<M: Model>() -> Result<()> {
    validate_collection_name(&M::collection_name())?;

    let schema = M::schema();
    schema.validate()?;
    if schema.identity_name() != DEFAULT_IDENTITY {
        return Err(OdmError::InvalidModel(format!(
            "identity field of '{}' must be named '{}', found '{}'",
            M::model_name(),
            DEFAULT_IDENTITY,
            schema.identity_name()
        )));
    }

    for spec in M::indexes() {
        let fields = spec.keys().fields();
        if fields.is_empty() || fields.iter().any(|(field, _)| field.is_empty()) {
            return Err(OdmError::InvalidModel(format!(
                "index on '{}' has an empty key",
                M::model_name()
            )));
        }
        if let IndexKeys::Single(field) = spec.keys()
            && field == DEFAULT_IDENTITY
        {
            return Err(OdmError::InvalidModel(format!(
                "'{}' is indexed implicitly on '{}'",
                DEFAULT_IDENTITY,
                M::model_name()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Entity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Unsaved,
    Persisted,
}

/// A model value plus the state it had when last read or written.
#[derive(Debug, Clone)]
pub struct Entity<M> {
    value: M,
    snapshot: Option<Document>,
}

impl<M: Model> Entity<M> {
    pub fn new(value: M) -> Self {
        Self {
            value,
            snapshot: None,
        }
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.value.id()
    }

    pub fn state(&self) -> EntityState {
        match self.value.id() {
            Some(_) => EntityState::Persisted,
            None => EntityState::Unsaved,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.state() == EntityState::Persisted
    }

    /// Wire form of the last known stored state.
    pub fn snapshot(&self) -> Option<&Document> {
        self.snapshot.as_ref()
    }

    pub fn into_inner(self) -> M {
        self.value
    }
}

impl<M: Model> From<M> for Entity<M> {
    fn from(value: M) -> Self {
        Self::new(value)
    }
}

impl<M> Deref for Entity<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.value
    }
}

impl<M> DerefMut for Entity<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.value
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Registered model bound to one collection, optionally inside a session.
pub struct ModelHandle<M> {
    collection: Arc<dyn StoreCollection>,
    schema: Arc<Schema>,
    session: Option<Arc<dyn StoreSession>>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            schema: self.schema.clone(),
            session: self.session.clone(),
            _model: PhantomData,
        }
    }
}

impl<M> fmt::Debug for ModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("collection", &self.collection.name())
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}

impl<M: Model> ModelHandle<M> {
    pub(crate) fn new(collection: Arc<dyn StoreCollection>, schema: Schema) -> Self {
        Self {
            collection,
            schema: Arc::new(schema),
            session: None,
            _model: PhantomData,
        }
    }

    pub(crate) fn with_session(&self, session: Arc<dyn StoreSession>) -> Self {
        Self {
            session: Some(session),
            ..self.clone()
        }
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    pub fn collection(&self) -> Arc<dyn StoreCollection> {
        self.collection.clone()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Session this handle runs in, if bound to a transaction.
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id())
    }

    fn session(&self) -> Option<&dyn StoreSession> {
        self.session.as_deref()
    }

    // ------------------------------------------------------------------------
    // Conversion
    // ------------------------------------------------------------------------

    fn encode(&self, value: &M) -> Result<Document> {
        let doc = into_document(serde_json::to_value(value)?)?;
        self.schema.validate_document(&doc)?;
        self.schema.to_wire(doc)
    }

    fn decode(&self, raw: Document) -> Result<Entity<M>> {
        let doc = self.schema.from_wire(raw)?;
        let value: M = serde_json::from_value(Value::Object(doc))?;
        let snapshot = self.encode(&value)?;
        Ok(Entity {
            value,
            snapshot: Some(snapshot),
        })
    }

    fn filter(&self, filter: Value) -> Result<Document> {
        self.schema.filter_to_wire(into_document(filter)?)
    }

    fn id_filter(id: ObjectId) -> Document {
        let mut filter = Document::new();
        filter.insert(ID_FIELD.to_string(), id.to_native());
        filter
    }

    fn require_id(entity: &Entity<M>) -> Result<ObjectId> {
        entity.id().ok_or(OdmError::DoesNotExist)
    }

    async fn fetch(&self, filter: Document) -> Result<Option<Entity<M>>> {
        debug!(collection = self.collection_name(), ?filter, "find_one");
        self.collection
            .find_one(filter, self.session())
            .await?
            .map(|raw| self.decode(raw))
            .transpose()
    }

    // ------------------------------------------------------------------------
    // Single-entity lifecycle
    // ------------------------------------------------------------------------

    /// Insert an unsaved entity and refresh it from the store.
    pub async fn create(&self, entity: &mut Entity<M>) -> Result<()> {
        if entity.id().is_some() {
            return Err(OdmError::AlreadyExists);
        }

        let doc = self.encode(&entity.value)?;
        debug!(collection = self.collection_name(), "insert_one");
        let inserted = self.collection.insert_one(doc, self.session()).await?;

        *entity = self
            .fetch(Self::id_filter(inserted.inserted_id))
            .await?
            .ok_or(OdmError::DoesNotExist)?;
        Ok(())
    }

    /// Persist the entity: insert when unsaved, otherwise `$set` the changed fields.
    pub async fn save(&self, entity: &mut Entity<M>) -> Result<()> {
        let Some(id) = entity.id() else {
            return self.create(entity).await;
        };

        let current = self.encode(&entity.value)?;
        let changes = match &entity.snapshot {
            Some(previous) => diff(previous, &current),
            None => current.clone(),
        };

        if changes.is_empty() {
            debug!(collection = self.collection_name(), %id, "save skipped, nothing changed");
        } else {
            debug!(collection = self.collection_name(), %id, fields = changes.len(), "update_one");
            let update = into_document(json!({ "$set": changes }))?;
            self.collection
                .update_one(Self::id_filter(id), update, self.session())
                .await?;
        }

        entity.snapshot = Some(current);
        Ok(())
    }

    /// Apply a raw update instruction to the stored entity and reload it.
    pub async fn update(&self, entity: &mut Entity<M>, instruction: Value) -> Result<()> {
        let id = Self::require_id(entity)?;
        let update = into_document(instruction)?;

        debug!(collection = self.collection_name(), %id, "update_one");
        let result = self
            .collection
            .update_one(Self::id_filter(id), update, self.session())
            .await?;
        if result.matched_count == 0 {
            return Err(OdmError::DoesNotExist);
        }

        *entity = self
            .fetch(Self::id_filter(id))
            .await?
            .ok_or(OdmError::DoesNotExist)?;
        Ok(())
    }

    /// Overwrite the stored document with the entity's full state.
    pub async fn replace(&self, entity: &mut Entity<M>) -> Result<()> {
        let id = Self::require_id(entity)?;
        let doc = self.encode(&entity.value)?;

        debug!(collection = self.collection_name(), %id, "replace_one");
        let result = self
            .collection
            .replace_one(Self::id_filter(id), doc.clone(), self.session())
            .await?;
        if result.matched_count == 0 {
            return Err(OdmError::DoesNotExist);
        }

        entity.snapshot = Some(doc);
        Ok(())
    }

    /// Re-read the stored state, discarding local changes.
    pub async fn reload(&self, entity: &mut Entity<M>) -> Result<()> {
        let id = Self::require_id(entity)?;
        *entity = self
            .fetch(Self::id_filter(id))
            .await?
            .ok_or(OdmError::DoesNotExist)?;
        Ok(())
    }

    /// Delete the stored entity. The local value survives without an id.
    ///
    /// Only a missing id is an error. A document removed behind the
    /// entity's back still counts as deleted.
    pub async fn delete(&self, entity: &mut Entity<M>) -> Result<()> {
        let id = Self::require_id(entity)?;

        debug!(collection = self.collection_name(), %id, "delete_one");
        let result = self
            .collection
            .delete_one(Self::id_filter(id), self.session())
            .await?;
        if result.deleted_count == 0 {
            debug!(collection = self.collection_name(), %id, "document was already gone");
        }

        entity.value.set_id(None);
        entity.snapshot = None;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// First entity matching `filter`.
    pub async fn get(&self, filter: Value) -> Result<Entity<M>> {
        self.find_one(filter).await?.ok_or(OdmError::DoesNotExist)
    }

    pub async fn find_one(&self, filter: Value) -> Result<Option<Entity<M>>> {
        let filter = self.filter(filter)?;
        self.fetch(filter).await
    }

    pub async fn get_by_id(&self, id: ObjectId) -> Result<Entity<M>> {
        self.fetch(Self::id_filter(id))
            .await?
            .ok_or(OdmError::DoesNotExist)
    }

    pub async fn get_many(&self, filter: Value) -> Result<ModelCursor<M>> {
        self.get_many_with(filter, FindOptions::default()).await
    }

    pub async fn get_many_with(&self, filter: Value, mut options: FindOptions) -> Result<ModelCursor<M>> {
        let filter = self.filter(filter)?;
        let identity = self.schema.identity_name();
        for (field, _) in &mut options.sort {
            if field == identity {
                *field = ID_FIELD.to_string();
            }
        }

        debug!(collection = self.collection_name(), ?filter, ?options, "find");
        let cursor = self.collection.find(filter, options, self.session()).await?;
        Ok(ModelCursor {
            cursor,
            handle: self.clone(),
        })
    }

    pub async fn count(&self, filter: Value) -> Result<u64> {
        let filter = self.filter(filter)?;
        debug!(collection = self.collection_name(), ?filter, "count_documents");
        self.collection.count_documents(filter, self.session()).await
    }

    /// Apply `instruction` to every match. Returns the number of modified documents.
    pub async fn update_many(&self, filter: Value, instruction: Value) -> Result<u64> {
        let filter = self.filter(filter)?;
        let update = into_document(instruction)?;
        debug!(collection = self.collection_name(), ?filter, "update_many");
        let result = self
            .collection
            .update_many(filter, update, self.session())
            .await?;
        Ok(result.modified_count)
    }

    /// Delete every match. Returns the number of deleted documents.
    pub async fn delete_many(&self, filter: Value) -> Result<u64> {
        let filter = self.filter(filter)?;
        debug!(collection = self.collection_name(), ?filter, "delete_many");
        let result = self.collection.delete_many(filter, self.session()).await?;
        Ok(result.deleted_count)
    }

    /// Return the first match, or create one from `matching` and `extra`.
    ///
    /// Fields in `matching` win over `extra`. The lookup and the insert are
    /// separate operations; a concurrent insert surfaces as an error.
    pub async fn get_or_create(&self, matching: Value, extra: Value) -> Result<(Entity<M>, bool)> {
        let matching = into_document(matching)?;
        if let Some(found) = self.find_one(Value::Object(matching.clone())).await? {
            return Ok((found, false));
        }

        let mut doc = into_document(extra)?;
        for (key, value) in matching {
            if !key.starts_with('$') {
                set_path(&mut doc, &key, value)?;
            }
        }
        doc.remove(self.schema.identity_name());
        doc.remove(ID_FIELD);

        let doc = self.schema.from_wire(doc)?;
        let value: M = serde_json::from_value(Value::Object(doc))?;
        let mut entity = Entity::new(value);
        self.create(&mut entity).await?;
        Ok((entity, true))
    }

    pub async fn index_information(&self) -> Result<BTreeMap<String, IndexInfo>> {
        self.collection.index_information().await
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Lazily decoded result set. Consumed once.
pub struct ModelCursor<M> {
    cursor: Box<dyn StoreCursor>,
    handle: ModelHandle<M>,
}

impl<M: Model> ModelCursor<M> {
    pub async fn next(&mut self) -> Result<Option<Entity<M>>> {
        match self.cursor.next().await? {
            Some(raw) => self.handle.decode(raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn try_collect(mut self) -> Result<Vec<Entity<M>>> {
        let mut entities = Vec::new();
        while let Some(entity) = self.next().await? {
            entities.push(entity);
        }
        Ok(entities)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Entity<M>>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok::<_, OdmError>(cursor.next().await?.map(|entity| (entity, cursor)))
        })
    }
}
