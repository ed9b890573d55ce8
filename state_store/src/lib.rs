use std::sync::Arc;

use anyhow::{Context, Result};
use driver::{ConnectionOptions, DocumentStore};
use indexes::{IndexSyncOptions, IndexSynchronizer};
use lock::{DistributedLock, DocumentLock};
use metrics::SchemaMetrics;
use migration_runner::MigrationRunner;
use migrations::{MigrationCatalog, SchemaVersionResolver};
use schema_guard::SchemaGuard;
use singleton::{RetryPolicy, VersionedSingletonStore};

pub mod driver;
pub mod indexes;
pub mod lock;
pub mod migration_runner;
pub mod migrations;
pub mod schema_guard;
pub mod serializer;
pub mod singleton;
#[cfg(test)]
pub(crate) mod testing;

/// The document store together with the schema primitives built on it.
#[derive(Clone)]
pub struct SchemaStore {
    pub store: Arc<dyn DocumentStore>,
    pub singletons: VersionedSingletonStore,
    pub lock: Arc<dyn DistributedLock>,
    pub metrics: Arc<SchemaMetrics>,
}

impl SchemaStore {
    pub fn open(options: ConnectionOptions, retry: RetryPolicy) -> Result<Self> {
        let store = driver::open_database(options).context("opening document store")?;
        Ok(Self::with_store(store, retry))
    }

    pub fn with_store(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        let metrics = Arc::new(SchemaMetrics::new());
        let singletons =
            VersionedSingletonStore::new(store.clone(), metrics.clone()).with_retry_policy(retry);
        Self {
            lock: Arc::new(DocumentLock::new(store.clone())),
            store,
            singletons,
            metrics,
        }
    }

    pub fn migration_runner(&self, catalog: Arc<MigrationCatalog>) -> MigrationRunner {
        MigrationRunner::new(catalog, self.singletons.clone(), self.metrics.clone())
    }

    pub fn schema_guard(&self, catalog: Arc<MigrationCatalog>) -> SchemaGuard {
        SchemaGuard::new(
            SchemaVersionResolver::new(catalog.clone(), self.singletons.clone()),
            self.migration_runner(catalog),
        )
    }

    pub fn index_synchronizer(&self, options: IndexSyncOptions) -> IndexSynchronizer {
        IndexSynchronizer::new(
            self.store.clone(),
            self.lock.clone(),
            options,
            self.metrics.clone(),
        )
    }
}
