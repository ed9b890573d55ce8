//! Secondary index reconciliation.
//!
//! Every collection owner declares the indexes it expects. At startup the
//! declared set is compared with what the store reports and the missing or
//! changed ones are created under the `schema-upgrade` lock, so instances
//! of different builds never race on the same index. Indexes the running
//! build no longer declares are only reported: an older build still online
//! may depend on them.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use data_model::{IndexInfo, IndexSpec};
use metrics::{SchemaMetrics, Timer};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    driver::{self, DocumentStore},
    lock::{DistributedLock, Lease},
};

/// Key of the lock serializing index changes across instances.
pub const SCHEMA_UPGRADE_LOCK: &str = "schema-upgrade";

/// How often a waiting instance retries the lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts of acquire, create and release before giving up.
pub const RECONCILE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("failed to create index {index} on {collection}: {source}")]
    IndexCreate {
        collection: String,
        index: String,
        source: driver::Error,
    },

    #[error("index reconciliation of {collection} was cancelled")]
    Cancelled { collection: String },

    #[error(transparent)]
    Driver(#[from] driver::Error),
}

#[derive(Debug, Clone)]
pub struct IndexSyncOptions {
    /// Only log what would change.
    pub read_only: bool,
    /// Lease taken on the lock per attempt.
    pub lease: Duration,
    /// Give up waiting for the lock after this long. `None` waits until
    /// cancelled.
    pub acquire_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for IndexSyncOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            lease: Duration::from_secs(300),
            acquire_timeout: None,
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }
}

/// Difference between the declared and the actual indexes of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPlan {
    pub to_create: Vec<IndexSpec>,
    pub to_remove: Vec<String>,
}

impl IndexPlan {
    /// Diffs by name. A declared index whose definition changed is created
    /// again; the primary key index is never part of the plan.
    pub fn diff(actual: &[IndexInfo], desired: &[IndexSpec]) -> Self {
        let actual: HashMap<&str, &IndexInfo> = actual
            .iter()
            .filter(|index| !index.is_primary_key())
            .map(|index| (index.name.as_str(), index))
            .collect();

        let to_create = desired
            .iter()
            .filter(|spec| match actual.get(spec.name.as_str()) {
                Some(existing) => !spec.same_definition(existing),
                None => true,
            })
            .cloned()
            .collect();

        let mut to_remove: Vec<String> = actual
            .keys()
            .filter(|name| !desired.iter().any(|spec| spec.name == **name))
            .map(|name| name.to_string())
            .collect();
        to_remove.sort();

        Self {
            to_create,
            to_remove,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty()
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    /// Actual indexes no longer declared. Never dropped.
    pub advisory_removals: Vec<String>,
    /// Creates skipped because the synchronizer is read-only.
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct IndexSynchronizer {
    store: Arc<dyn DocumentStore>,
    lock: Arc<dyn DistributedLock>,
    options: IndexSyncOptions,
    metrics: Arc<SchemaMetrics>,
}

impl IndexSynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        lock: Arc<dyn DistributedLock>,
        options: IndexSyncOptions,
        metrics: Arc<SchemaMetrics>,
    ) -> Self {
        Self {
            store,
            lock,
            options,
            metrics,
        }
    }

    pub async fn plan(&self, collection: &str, desired: &[IndexSpec]) -> Result<IndexPlan, Error> {
        let actual = self.store.list_indexes(collection).await?;
        Ok(IndexPlan::diff(&actual, desired))
    }

    /// Brings the indexes of `collection` in line with `desired`.
    pub async fn reconcile(
        &self,
        collection: &str,
        desired: &[IndexSpec],
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, Error> {
        let plan = self.plan(collection, desired).await?;
        if plan.is_empty() {
            debug!(collection, "indexes up to date");
            return Ok(ReconcileReport::default());
        }

        if self.options.read_only {
            warn_removals(collection, &plan.to_remove);
            for spec in &plan.to_create {
                info!(
                    collection,
                    index = %spec.name,
                    "read-only mode, skipping index creation"
                );
            }
            return Ok(ReconcileReport {
                created: Vec::new(),
                skipped: plan.to_create.iter().map(|spec| spec.name.clone()).collect(),
                advisory_removals: plan.to_remove,
            });
        }

        let mut attempt = 1;
        loop {
            match self.reconcile_locked(collection, desired, cancel).await {
                Ok(report) => return Ok(report),
                Err(err @ Error::Cancelled { .. }) => return Err(err),
                Err(err) if attempt >= RECONCILE_ATTEMPTS => {
                    error!(collection, attempt, "index reconciliation failed: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(collection, attempt, "index reconciliation failed, retrying: {err}");
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: take the lock, diff again and create what is missing.
    async fn reconcile_locked(
        &self,
        collection: &str,
        desired: &[IndexSpec],
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, Error> {
        let lease = self.acquire(collection, cancel).await?;
        let result = self.apply_plan(collection, desired, cancel).await;
        if let Err(err) = self.lock.release(&lease).await {
            warn!(collection, "failed to release {SCHEMA_UPGRADE_LOCK} lock: {err}");
        }
        result
    }

    async fn acquire(&self, collection: &str, cancel: &CancellationToken) -> Result<Lease, Error> {
        let _timer = Timer::start(&self.metrics.lock_wait);
        let started = Instant::now();
        loop {
            if let Some(lease) = self
                .lock
                .try_acquire(SCHEMA_UPGRADE_LOCK, self.options.lease)
                .await?
            {
                debug!(collection, "acquired {SCHEMA_UPGRADE_LOCK} lock");
                return Ok(lease);
            }
            if let Some(timeout) = self.options.acquire_timeout {
                if started.elapsed() >= timeout {
                    return Err(Error::LockTimeout {
                        key: SCHEMA_UPGRADE_LOCK.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }
            debug!(collection, "waiting for {SCHEMA_UPGRADE_LOCK} lock");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { collection: collection.to_string() });
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    async fn apply_plan(
        &self,
        collection: &str,
        desired: &[IndexSpec],
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, Error> {
        // Another instance may have done the work while this one waited.
        let plan = self.plan(collection, desired).await?;
        warn_removals(collection, &plan.to_remove);

        let labels = [KeyValue::new("collection", collection.to_string())];
        let mut created = Vec::with_capacity(plan.to_create.len());
        for spec in &plan.to_create {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    collection: collection.to_string(),
                });
            }
            info!(collection, index = %spec.name, unique = spec.unique, "creating index");
            match self.store.create_index(collection, spec).await {
                Ok(name) => {
                    self.metrics.index_creates.add(1, &labels);
                    created.push(name);
                }
                Err(source) => {
                    self.metrics.index_create_errors.add(1, &labels);
                    error!(collection, index = %spec.name, "failed to create index: {source}");
                    return Err(Error::IndexCreate {
                        collection: collection.to_string(),
                        index: spec.name.clone(),
                        source,
                    });
                }
            }
        }

        Ok(ReconcileReport {
            created,
            advisory_removals: plan.to_remove,
            skipped: Vec::new(),
        })
    }
}

fn warn_removals(collection: &str, names: &[String]) {
    for name in names {
        warn!(
            collection,
            index = %name,
            "index is not declared by this build; drop it manually once no running version uses it"
        );
    }
}
