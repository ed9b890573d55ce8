//! Versioned singleton documents.
//!
//! A singleton is the one document stored under a fixed logical id. Writes
//! go through an optimistic read-mutate-write loop: the replacement only
//! lands if the stored `revision` is still the one that was read, and the
//! revision grows by one with every committed write. No in-process lock is
//! held while the caller's mutation runs.

use std::{fmt::Debug, sync::Arc, time::Duration};

use data_model::{PluginSchemaState, SingletonDocument, PLUGIN_SCHEMA_STATE_ID};
use metrics::SchemaMetrics;
use opentelemetry::KeyValue;
use schema_utils::jittered_backoff;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::driver::{self, DocumentStore, InsertOutcome, ReplaceFilter};

/// Collection holding every singleton document.
pub const SINGLETONS_COLLECTION: &str = "singletons";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("singleton {id} lost the revision race {attempts} times in a row")]
    ConcurrencyConflict { id: String, attempts: u32 },

    #[error("access to singleton {id} was cancelled")]
    Cancelled { id: String },

    #[error("failed to decode singleton {id}: {source}")]
    Decode {
        id: String,
        source: serde_json::Error,
    },

    #[error("failed to encode singleton {id}: {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },

    #[error("singleton {id} vanished after a concurrent insert")]
    Vanished { id: String },

    #[error(transparent)]
    Driver(#[from] driver::Error),
}

/// A payload stored as a singleton document.
pub trait Singleton: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Logical id the document is stored under.
    const ID: &'static str;

    /// Id of a document written by an earlier layout of this payload. It is
    /// adopted once, the first time `ID` is found missing.
    const LEGACY_ID: Option<&'static str> = None;

    fn from_legacy(legacy: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(legacy)
    }
}

impl Singleton for PluginSchemaState {
    const ID: &'static str = PLUGIN_SCHEMA_STATE_ID;
}

/// How often and how fast a losing writer retries.
///
/// `max_attempts = None` retries until the write lands or the caller
/// cancels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Clone)]
pub struct VersionedSingletonStore {
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    metrics: Arc<SchemaMetrics>,
}

impl VersionedSingletonStore {
    pub fn new(store: Arc<dyn DocumentStore>, metrics: Arc<SchemaMetrics>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            metrics,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Reads the singleton, creating it from `T::default()` when missing.
    pub async fn get<T: Singleton + Default>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SingletonDocument<T>, Error> {
        self.get_or_init(T::default, cancel).await
    }

    /// Reads the singleton, creating it when missing.
    ///
    /// A missing document is seeded from the legacy document when `T` names
    /// one and it exists, otherwise from `init`. When another caller inserts
    /// first, its document is returned instead.
    pub async fn get_or_init<T, F>(
        &self,
        init: F,
        cancel: &CancellationToken,
    ) -> Result<SingletonDocument<T>, Error>
    where
        T: Singleton,
        F: FnOnce() -> T + Send,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                id: T::ID.to_string(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled { id: T::ID.to_string() }),
            result = self.load_or_insert(init) => result,
        }
    }

    async fn load_or_insert<T, F>(&self, init: F) -> Result<SingletonDocument<T>, Error>
    where
        T: Singleton,
        F: FnOnce() -> T + Send,
    {
        if let Some(stored) = self.store.find_by_id(SINGLETONS_COLLECTION, T::ID).await? {
            return decode(stored);
        }

        let payload = match self.load_legacy::<T>().await? {
            Some(payload) => payload,
            None => init(),
        };
        let document = SingletonDocument::new(T::ID, payload);
        let encoded = serde_json::to_value(&document).map_err(|source| Error::Encode {
            id: T::ID.to_string(),
            source,
        })?;

        match self
            .store
            .insert_if_absent(SINGLETONS_COLLECTION, encoded)
            .await?
        {
            InsertOutcome::Inserted => {
                debug!(id = T::ID, "created singleton document");
                Ok(document)
            }
            InsertOutcome::AlreadyExists => {
                debug!(id = T::ID, "lost the insert race, reading the winner");
                match self.store.find_by_id(SINGLETONS_COLLECTION, T::ID).await? {
                    Some(stored) => decode(stored),
                    None => Err(Error::Vanished {
                        id: T::ID.to_string(),
                    }),
                }
            }
        }
    }

    async fn load_legacy<T: Singleton>(&self) -> Result<Option<T>, Error> {
        let Some(legacy_id) = T::LEGACY_ID else {
            return Ok(None);
        };
        let Some(legacy) = self
            .store
            .find_by_id(SINGLETONS_COLLECTION, legacy_id)
            .await?
        else {
            return Ok(None);
        };
        info!(id = T::ID, legacy_id, "adopting legacy singleton document");
        T::from_legacy(legacy)
            .map(Some)
            .map_err(|source| Error::Decode {
                id: legacy_id.to_string(),
                source,
            })
    }

    /// Applies `mutate` to the latest payload until the write lands.
    ///
    /// `mutate` returns false when it made no change; nothing is written
    /// then. It may run several times, once per attempt, each time on a
    /// fresh read. Returns the document as last written or read.
    pub async fn update<T, F>(
        &self,
        mut mutate: F,
        cancel: &CancellationToken,
    ) -> Result<SingletonDocument<T>, Error>
    where
        T: Singleton + Default,
        F: FnMut(&mut T) -> bool + Send,
    {
        let labels = [KeyValue::new("singleton", T::ID)];
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    id: T::ID.to_string(),
                });
            }
            attempts += 1;

            let mut document = self.get::<T>(cancel).await?;
            if !mutate(&mut document.payload) {
                return Ok(document);
            }

            let filter = ReplaceFilter::by_revision(T::ID, document.revision);
            document.revision += 1;
            let encoded = serde_json::to_value(&document).map_err(|source| Error::Encode {
                id: T::ID.to_string(),
                source,
            })?;
            let matched = self
                .store
                .conditional_replace(SINGLETONS_COLLECTION, &filter, encoded)
                .await?;
            if matched > 0 {
                self.metrics.singleton_writes.add(1, &labels);
                return Ok(document);
            }

            self.metrics.singleton_conflicts.add(1, &labels);
            debug!(
                id = T::ID,
                revision = document.revision - 1,
                attempts,
                "singleton revision moved, retrying"
            );
            if self.retry.exhausted(attempts) {
                return Err(Error::ConcurrencyConflict {
                    id: T::ID.to_string(),
                    attempts,
                });
            }

            let delay = jittered_backoff(self.retry.min_backoff, self.retry.max_backoff, attempts);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled { id: T::ID.to_string() });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn decode<T: Singleton>(stored: Value) -> Result<SingletonDocument<T>, Error> {
    serde_json::from_value(stored).map_err(|source| Error::Decode {
        id: T::ID.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{driver::InMemoryDriver, testing::RecordingStore};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u64,
    }

    impl Singleton for Counter {
        const ID: &'static str = "counter";
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct IssueLedger {
        next_issue: u64,
    }

    impl Singleton for IssueLedger {
        const ID: &'static str = "issue-ledger";
        const LEGACY_ID: Option<&'static str> = Some("5e4c4e1c3fd7aa02e4b1c7f0");

        fn from_legacy(legacy: Value) -> Result<Self, serde_json::Error> {
            Ok(Self {
                next_issue: legacy
                    .get("NextId")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
            })
        }
    }

    fn singletons(store: Arc<dyn DocumentStore>) -> VersionedSingletonStore {
        VersionedSingletonStore::new(store, Arc::new(SchemaMetrics::new()))
    }

    #[tokio::test]
    async fn test_get_creates_default_at_revision_zero() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        let singletons = singletons(store.clone());

        let doc = singletons.get::<Counter>(&CancellationToken::new()).await.unwrap();
        assert_eq!(doc.revision, 0);
        assert_eq!(doc.payload, Counter::default());

        let stored = store
            .find_by_id(SINGLETONS_COLLECTION, "counter")
            .await
            .unwrap();
        assert_eq!(stored, Some(json!({"_id": "counter", "revision": 0, "count": 0})));
    }

    #[tokio::test]
    async fn test_get_returns_existing_winner() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        store
            .insert_if_absent(
                SINGLETONS_COLLECTION,
                json!({"_id": "counter", "revision": 7, "count": 3}),
            )
            .await
            .unwrap();

        let doc = singletons(store)
            .get_or_init(|| Counter { count: 100 }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.revision, 7);
        assert_eq!(doc.payload.count, 3);
    }

    #[tokio::test]
    async fn test_update_increments_revision() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        let singletons = singletons(store);
        let cancel = CancellationToken::new();

        let doc = singletons
            .update(
                |counter: &mut Counter| {
                    counter.count += 1;
                    true
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(doc.revision, 1);
        assert_eq!(doc.payload.count, 1);

        let doc = singletons
            .update(|_: &mut Counter| false, &cancel)
            .await
            .unwrap();
        assert_eq!(doc.revision, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        let singletons = singletons(store);
        let cancel = CancellationToken::new();

        let writers = 16;
        let mut handles = Vec::new();
        for _ in 0..writers {
            let singletons = singletons.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                singletons
                    .update(
                        |counter: &mut Counter| {
                            counter.count += 1;
                            true
                        },
                        &cancel,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let doc = singletons.get::<Counter>(&CancellationToken::new()).await.unwrap();
        assert_eq!(doc.payload.count, writers);
        assert_eq!(doc.revision, writers);
    }

    #[tokio::test]
    async fn test_legacy_document_is_adopted() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        store
            .insert_if_absent(
                SINGLETONS_COLLECTION,
                json!({"_id": "5e4c4e1c3fd7aa02e4b1c7f0", "NextId": 42}),
            )
            .await
            .unwrap();

        let doc = singletons(store.clone())
            .get::<IssueLedger>(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.id, "issue-ledger");
        assert_eq!(doc.revision, 0);
        assert_eq!(doc.payload.next_issue, 42);

        let stored = store
            .find_by_id(SINGLETONS_COLLECTION, "issue-ledger")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["next_issue"], 42);
    }

    #[tokio::test]
    async fn test_bounded_policy_surfaces_conflict() {
        let store = RecordingStore::new();
        store.reject_replaces();
        let singletons = singletons(store.clone()).with_retry_policy(RetryPolicy {
            max_attempts: Some(3),
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        });

        let err = singletons
            .update(
                |counter: &mut Counter| {
                    counter.count += 1;
                    true
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConcurrencyConflict { attempts: 3, .. }
        ));
        assert_eq!(store.replace_calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_update() {
        let store = RecordingStore::new();
        store.reject_replaces();
        let singletons = singletons(store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = singletons
            .update(
                |counter: &mut Counter| {
                    counter.count += 1;
                    true
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_store_errors_are_not_retried() {
        let store = RecordingStore::new();
        store.set_unavailable(true);
        let err = singletons(store.clone())
            .update(
                |counter: &mut Counter| {
                    counter.count += 1;
                    true
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Driver(driver::Error::Unavailable { .. })
        ));
        assert_eq!(store.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_insert_race_returns_the_winner() {
        let store = RecordingStore::new();
        store
            .insert_if_absent(
                SINGLETONS_COLLECTION,
                json!({"_id": "counter", "revision": 7, "count": 3}),
            )
            .await
            .unwrap();
        // The first read misses the document another writer is inserting.
        store.hide_next_finds(1);

        let doc = singletons(store)
            .get_or_init(|| Counter { count: 100 }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.revision, 7);
        assert_eq!(doc.payload, Counter { count: 3 });
    }

    #[tokio::test]
    async fn test_insert_race_with_missing_winner_is_vanished() {
        let store = RecordingStore::new();
        store
            .insert_if_absent(
                SINGLETONS_COLLECTION,
                json!({"_id": "counter", "revision": 1, "count": 3}),
            )
            .await
            .unwrap();
        store.hide_next_finds(2);

        let err = singletons(store)
            .get::<Counter>(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Vanished { ref id } if id == "counter"));
    }

    #[tokio::test]
    async fn test_cancelled_get() {
        let store = RecordingStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = singletons(store.clone())
            .get::<Counter>(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(
            store
                .find_by_id(SINGLETONS_COLLECTION, "counter")
                .await
                .unwrap(),
            None
        );
    }
}
