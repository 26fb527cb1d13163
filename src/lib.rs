// ============================================================================
// docmapper library
// ============================================================================

//! Asynchronous object-document mapper.
//!
//! Models are plain serde types implementing [`Model`]. A [`Database`]
//! registers them, hands out [`ModelHandle`]s for the entity lifecycle and
//! runs deferred index provisioning on [`Database::materialize`]. Documents
//! reach the store through the driver traits in [`store`]; an in-memory
//! driver is bundled.
//!
//! # Examples
//!
//! ```
//! use docmapper::{ClientConfig, Database, Entity, IndexSpec, Model, ObjectId};
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     id: Option<ObjectId>,
//!     email: String,
//! }
//!
//! impl Model for User {
//!     fn id(&self) -> Option<ObjectId> { self.id }
//!     fn set_id(&mut self, id: Option<ObjectId>) { self.id = id; }
//!     fn indexes() -> Vec<IndexSpec> { vec![IndexSpec::new("email").unique(true)] }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> docmapper::Result<()> {
//! let db = Database::connect(ClientConfig::memory(), Some("app"))?;
//! let users = db.register::<User>()?;
//! db.materialize().await?;
//!
//! let mut user = Entity::new(User { id: None, email: "a@example.com".into() });
//! users.save(&mut user).await?;
//!
//! let found = users.get(json!({ "email": "a@example.com" })).await?;
//! assert_eq!(found.id(), user.id());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod database;
pub mod diff;
pub mod index;
pub mod jobs;
pub mod model;
pub mod schema;
pub mod store;
pub mod transaction;

pub use config::ClientConfig;
pub use self::core::{Document, ObjectId, OdmError, Result};
pub use database::{Database, ModelBinding};
pub use diff::diff;
pub use index::{ASC, DESC, IndexDirection, IndexKeys, IndexSpec};
pub use jobs::{IndexJob, Job};
pub use model::{Entity, EntityState, Model, ModelCursor, ModelHandle};
pub use schema::{FieldDef, FieldKind, Schema};
pub use store::{FindOptions, IndexInfo, MemoryClient};
pub use transaction::{SessionGuard, TransactionScope};
