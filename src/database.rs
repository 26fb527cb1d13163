//! Connection registry.
//!
//! A [`Database`] owns the store client, the selected database, the queue of
//! deferred provisioning jobs and the lazily created large-object bucket.
//! Models are bound to it with [`Database::register`].

use crate::config::{ClientConfig, MEMORY_SCHEME, validate_database_name};
use crate::core::{OdmError, Result};
use crate::jobs::{IndexJob, Job, JobQueue};
use crate::model::{Model, ModelHandle, validate_model};
use crate::store::{MemoryClient, StoreBucket, StoreClient, StoreCollection, StoreDatabase};
use crate::transaction::{SessionGuard, TransactionScope, run_in_transaction};
use once_cell::sync::OnceCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Name of the bucket returned by [`Database::bucket`].
pub const DEFAULT_BUCKET: &str = "fs";

struct DatabaseInner {
    client: Arc<dyn StoreClient>,
    store: Arc<dyn StoreDatabase>,
    jobs: JobQueue,
    bucket: OnceCell<Arc<dyn StoreBucket>>,
}

/// Registry tying models to one store database. Clones share state.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Connect with the driver selected by the config's URL scheme.
    ///
    /// `name` overrides the config's default database.
    ///
    /// # Examples
    ///
    /// ```
    /// use docmapper::{ClientConfig, Database};
    ///
    /// let db = Database::connect(ClientConfig::memory(), Some("shop")).unwrap();
    /// assert_eq!(db.name(), "shop");
    /// ```
    pub fn connect(config: ClientConfig, name: Option<&str>) -> Result<Self> {
        config.validate()?;
        if config.scheme != MEMORY_SCHEME {
            return Err(OdmError::Config(format!(
                "unsupported scheme '{}'",
                config.scheme
            )));
        }
        let client: Arc<dyn StoreClient> = Arc::new(MemoryClient::new(config));
        Self::with_client(client, name)
    }

    /// Use an already constructed client.
    pub fn with_client(client: Arc<dyn StoreClient>, name: Option<&str>) -> Result<Self> {
        let name = name
            .map(str::to_string)
            .or_else(|| client.default_database())
            .ok_or_else(|| OdmError::Config("no database name given".into()))?;
        validate_database_name(&name)?;

        let store = client.database(&name);
        info!(database = %name, "database connected");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                client,
                store,
                jobs: JobQueue::new(),
                bucket: OnceCell::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.store.name()
    }

    pub fn client(&self) -> Arc<dyn StoreClient> {
        self.inner.client.clone()
    }

    pub fn store(&self) -> Arc<dyn StoreDatabase> {
        self.inner.store.clone()
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        self.inner.store.list_collection_names().await
    }

    /// Bind `M` to its collection and queue its index jobs.
    ///
    /// Nothing is sent to the store until [`Database::materialize`] runs.
    pub fn register<M: Model>(&self) -> Result<ModelHandle<M>> {
        validate_model::<M>()?;

        let collection = self.inner.store.collection(&M::collection_name());
        let indexes = M::indexes();
        let index_count = indexes.len();
        for spec in indexes {
            self.inner.jobs.push(Box::new(IndexJob::new(
                M::model_name(),
                collection.clone(),
                spec,
            )));
        }

        info!(
            model = M::model_name(),
            collection = collection.name(),
            indexes = index_count,
            "model registered"
        );
        Ok(ModelHandle::new(collection, M::schema()))
    }

    /// Queue an arbitrary job for the next [`Database::materialize`].
    pub fn register_job(&self, job: Box<dyn Job>) {
        self.inner.jobs.push(job);
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Run every queued job and wait for all of them.
    ///
    /// Returns the job summaries (index names for index jobs), or the first
    /// failure once every job has finished.
    pub async fn materialize(&self) -> Result<Vec<String>> {
        let done = self.inner.jobs.run_all().await?;
        info!(database = self.name(), jobs = done.len(), "database materialized");
        Ok(done)
    }

    /// The database's large-object bucket, created on first use.
    pub fn bucket(&self) -> Arc<dyn StoreBucket> {
        self.inner
            .bucket
            .get_or_init(|| self.inner.store.bucket(DEFAULT_BUCKET))
            .clone()
    }

    pub async fn start_session(&self) -> Result<SessionGuard> {
        let session = self.inner.client.start_session().await?;
        Ok(SessionGuard::new(session))
    }

    /// Run `work` in a transaction on a new session.
    ///
    /// Committed when `work` returns `Ok`. On `Err` the transaction is
    /// aborted and the error is returned as is. Nested calls open
    /// independent sessions.
    pub async fn with_transaction<F, Fut, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<OdmError>,
    {
        let guard = self.start_session().await?;
        run_in_transaction(guard, work).await
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

/// Late-bound model handle, usable as a `static`.
///
/// ```
/// use docmapper::{ModelBinding, Model, ObjectId};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note {
///     id: Option<ObjectId>,
/// }
///
/// impl Model for Note {
///     fn id(&self) -> Option<ObjectId> { self.id }
///     fn set_id(&mut self, id: Option<ObjectId>) { self.id = id; }
/// }
///
/// static NOTES: ModelBinding<Note> = ModelBinding::new();
/// assert!(NOTES.get().is_err());
/// ```
pub struct ModelBinding<M> {
    slot: OnceCell<ModelHandle<M>>,
}

impl<M: Model> ModelBinding<M> {
    pub const fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// Register `M` with `db` and store the handle.
    pub fn bind(&self, db: &Database) -> Result<ModelHandle<M>> {
        if self.is_bound() {
            return Err(already_bound::<M>());
        }
        let handle = db.register::<M>()?;
        self.slot
            .set(handle.clone())
            .map_err(|_| already_bound::<M>())?;
        Ok(handle)
    }

    pub fn get(&self) -> Result<&ModelHandle<M>> {
        self.slot
            .get()
            .ok_or_else(|| OdmError::NotConnected(M::model_name().to_string()))
    }

    pub fn is_bound(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<M: Model> Default for ModelBinding<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn already_bound<M: Model>() -> OdmError {
    OdmError::InvalidOperation(format!("model '{}' is already bound", M::model_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_selects_database() {
        let db = Database::connect(ClientConfig::memory().database("app"), None).unwrap();
        assert_eq!(db.name(), "app");

        let db = Database::connect(ClientConfig::memory().database("app"), Some("other")).unwrap();
        assert_eq!(db.name(), "other");
    }

    #[test]
    fn test_connect_errors() {
        assert!(matches!(
            Database::connect(ClientConfig::memory(), None),
            Err(OdmError::Config(_))
        ));

        let mut config = ClientConfig::memory();
        config.scheme = "mongodb".into();
        assert!(matches!(
            Database::connect(config, Some("app")),
            Err(OdmError::Config(_))
        ));

        assert!(Database::connect(ClientConfig::memory(), Some("bad.name")).is_err());
    }

    #[test]
    fn test_bucket_is_created_once() {
        let db = Database::connect(ClientConfig::memory(), Some("app")).unwrap();
        let first = db.bucket();
        let second = db.bucket();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), DEFAULT_BUCKET);
    }
}
