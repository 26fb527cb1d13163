//! Session guards and transaction scopes.
//!
//! [`SessionGuard`] owns one store session and ends it when dropped, which
//! also aborts any transaction still open on it. Commits and aborts are
//! explicit async calls; dropping the guard is the fallback for every other
//! exit path, including a cancelled future.

use crate::core::Result;
use crate::model::{Model, ModelHandle};
use crate::store::StoreSession;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owned store session, ended on drop.
pub struct SessionGuard {
    session: Arc<dyn StoreSession>,
}

impl SessionGuard {
    pub(crate) fn new(session: Arc<dyn StoreSession>) -> Self {
        Self { session }
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn session(&self) -> Arc<dyn StoreSession> {
        self.session.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    pub async fn start_transaction(&self) -> Result<()> {
        debug!(session = self.id(), "starting transaction");
        self.session.start_transaction().await
    }

    pub async fn commit(&self) -> Result<()> {
        debug!(session = self.id(), "committing transaction");
        self.session.commit_transaction().await
    }

    pub async fn abort(&self) -> Result<()> {
        debug!(session = self.id(), "aborting transaction");
        self.session.abort_transaction().await
    }

    /// Scope handing out handles bound to this session.
    pub fn scope(&self) -> TransactionScope {
        TransactionScope {
            session: self.session.clone(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.in_transaction() {
            warn!(session = self.id(), "session dropped with an open transaction, aborting");
        }
        self.session.end_session();
    }
}

/// Handle factory for work running inside one transaction.
#[derive(Clone)]
pub struct TransactionScope {
    session: Arc<dyn StoreSession>,
}

impl TransactionScope {
    /// Copy of `handle` whose operations run in this transaction.
    pub fn bind<M: Model>(&self, handle: &ModelHandle<M>) -> ModelHandle<M> {
        handle.with_session(self.session.clone())
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }
}

/// Run `work` inside a transaction on a fresh session.
///
/// Commits when `work` succeeds. When it fails, the transaction is aborted
/// and the caller's error is returned unchanged.
pub(crate) async fn run_in_transaction<F, Fut, T, E>(guard: SessionGuard, work: F) -> std::result::Result<T, E>
where
    F: FnOnce(TransactionScope) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: From<crate::core::OdmError>,
{
    guard.start_transaction().await?;

    match work(guard.scope()).await {
        Ok(value) => {
            guard.commit().await?;
            Ok(value)
        }
        Err(err) => {
            warn!(session = guard.id(), "transaction body failed, aborting");
            if let Err(abort_err) = guard.abort().await {
                warn!(session = guard.id(), error = %abort_err, "abort failed");
            }
            Err(err)
        }
    }
}
