//! Document-store driver interface.
//!
//! The ODM layer only ever talks to a store through these traits. Every
//! collection operation takes an optional session; operations issued with a
//! session that has an open transaction belong to that transaction.

pub mod memory;

use crate::core::{Document, ObjectId, Result};
use crate::index::{IndexDirection, IndexSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use memory::MemoryClient;

/// Field name the store uses for document identity.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOneResult {
    pub inserted_id: ObjectId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Ordering and paging for multi-document reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, IndexDirection)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, field: impl Into<String>, direction: IndexDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Index metadata as reported by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub key: Vec<(String, i32)>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
    pub v: i32,
}

/// Metadata of one stored large object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: ObjectId,
    pub filename: String,
    pub length: u64,
    pub upload_date: DateTime<Utc>,
    pub metadata: Option<Document>,
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Database handle by name. Databases are created lazily by the store.
    fn database(&self, name: &str) -> Arc<dyn StoreDatabase>;

    /// Database named by the connection parameters, if any.
    fn default_database(&self) -> Option<String>;

    async fn start_session(&self) -> Result<Arc<dyn StoreSession>>;
}

#[async_trait]
pub trait StoreDatabase: Send + Sync {
    fn name(&self) -> &str;

    fn collection(&self, name: &str) -> Arc<dyn StoreCollection>;

    /// Construct a large-object bucket handle.
    fn bucket(&self, name: &str) -> Arc<dyn StoreBucket>;

    async fn list_collection_names(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait StoreCollection: Send + Sync {
    fn name(&self) -> &str;

    async fn find_one(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<Option<Document>>;

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        session: Option<&dyn StoreSession>,
    ) -> Result<Box<dyn StoreCursor>>;

    async fn count_documents(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<u64>;

    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<InsertOneResult>;

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult>;

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult>;

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<UpdateResult>;

    async fn delete_one(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<DeleteResult>;

    async fn delete_many(
        &self,
        filter: Document,
        session: Option<&dyn StoreSession>,
    ) -> Result<DeleteResult>;

    /// Create an index and return its name. Creating an identical index again is a no-op.
    async fn create_index(&self, spec: &IndexSpec) -> Result<String>;

    async fn index_information(&self) -> Result<BTreeMap<String, IndexInfo>>;
}

/// Lazily consumed result set. Not restartable.
#[async_trait]
pub trait StoreCursor: Send {
    async fn next(&mut self) -> Result<Option<Document>>;
}

/// A client session, optionally carrying one open transaction.
///
/// Sessions are only valid with collections of the client that started them.
/// Drivers recover their concrete session type through [`StoreSession::as_any`]
/// and reject any other with `OdmError::Transaction`.
#[async_trait]
pub trait StoreSession: Send + Sync {
    fn id(&self) -> u64;

    fn in_transaction(&self) -> bool;

    async fn start_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;

    /// Release the session. Any open transaction is aborted. Safe to call twice.
    fn end_session(&self);

    /// The session as `Any`, for downcasting to the driver's own type.
    /// Implementations return `self`.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait StoreBucket: Send + Sync {
    fn name(&self) -> &str;

    async fn upload(
        &self,
        filename: &str,
        data: Vec<u8>,
        metadata: Option<Document>,
    ) -> Result<ObjectId>;

    async fn download(&self, id: ObjectId) -> Result<Vec<u8>>;

    async fn delete(&self, id: ObjectId) -> Result<()>;

    async fn find_by_filename(&self, filename: &str) -> Result<Vec<FileInfo>>;
}
