//! Deferred provisioning jobs.
//!
//! Jobs are queued when models are registered and only run when the
//! registry is explicitly materialized, so model declarations never touch
//! the store.

use crate::core::{OdmError, Result};
use crate::index::IndexSpec;
use crate::store::StoreCollection;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// A deferred unit of work. Running a job twice must be safe.
#[async_trait]
pub trait Job: Send + Sync {
    fn describe(&self) -> String;

    /// Run the job, returning a short summary of what it did.
    async fn run(&self) -> Result<String>;
}

/// Creates one declared index for one model.
pub struct IndexJob {
    model: &'static str,
    collection: Arc<dyn StoreCollection>,
    spec: IndexSpec,
}

impl IndexJob {
    pub fn new(model: &'static str, collection: Arc<dyn StoreCollection>, spec: IndexSpec) -> Self {
        Self {
            model,
            collection,
            spec,
        }
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }
}

impl fmt::Debug for IndexJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexJob")
            .field("model", &self.model)
            .field("collection", &self.collection.name())
            .field("spec", &self.spec)
            .finish()
    }
}

#[async_trait]
impl Job for IndexJob {
    fn describe(&self) -> String {
        format!(
            "create index {} on {} ({})",
            self.spec.index_name(),
            self.collection.name(),
            self.model
        )
    }

    async fn run(&self) -> Result<String> {
        self.collection.create_index(&self.spec).await
    }
}

/// Ordered list of pending jobs.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<Box<dyn Job>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Box<dyn Job>) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn describe(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|job| job.describe())
            .collect()
    }

    fn take(&self) -> Vec<Box<dyn Job>> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drain the queue and run every job concurrently.
    ///
    /// Returns once all jobs have finished. If any failed, the first failure
    /// in queue order is returned; the others are logged.
    pub async fn run_all(&self) -> Result<Vec<String>> {
        let jobs = self.take();
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        info!(jobs = jobs.len(), "running provisioning jobs");
        let outcomes = join_all(jobs.iter().map(|job| job.run())).await;

        let mut done = Vec::with_capacity(outcomes.len());
        let mut first_error: Option<OdmError> = None;
        for (job, outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                Ok(summary) => done.push(summary),
                Err(err) => {
                    warn!(job = %job.describe(), error = %err, "provisioning job failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(done),
        }
    }
}
