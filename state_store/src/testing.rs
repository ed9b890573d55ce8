use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use data_model::{IndexInfo, IndexSpec};
use serde_json::Value;

use crate::driver::{DocumentStore, Error, InMemoryDriver, InsertOutcome, ReplaceFilter};

/// In-memory store that counts calls and injects failures.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryDriver,
    create_index_calls: AtomicUsize,
    replace_calls: AtomicUsize,
    failing_indexes: Mutex<HashSet<String>>,
    reject_replaces: AtomicBool,
    unavailable: AtomicBool,
    hidden_finds: AtomicUsize,
    write_after_scan: Mutex<Option<(String, Value)>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every `create_index` of `name` fail.
    pub fn fail_index(&self, name: &str) {
        self.failing_indexes.lock().unwrap().insert(name.to_string());
    }

    pub fn heal_index(&self, name: &str) {
        self.failing_indexes.lock().unwrap().remove(name);
    }

    /// Makes every conditional replace match nothing.
    pub fn reject_replaces(&self) {
        self.reject_replaces.store(true, Ordering::SeqCst);
    }

    /// Makes the next `count` lookups report a missing document.
    pub fn hide_next_finds(&self, count: usize) {
        self.hidden_finds.store(count, Ordering::SeqCst);
    }

    /// Replaces `document` in `collection` once, right after the next scan
    /// of that collection took its snapshot.
    pub fn write_after_scan(&self, collection: &str, document: Value) {
        *self.write_after_scan.lock().unwrap() = Some((collection.to_string(), document));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn create_index_calls(&self) -> usize {
        self.create_index_calls.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable {
                message: "injected outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, Error> {
        self.check_available()?;
        let hidden = self
            .hidden_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        self.inner.find_by_id(collection, id).await
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        document: Value,
    ) -> Result<InsertOutcome, Error> {
        self.check_available()?;
        self.inner.insert_if_absent(collection, document).await
    }

    async fn conditional_replace(
        &self,
        collection: &str,
        filter: &ReplaceFilter,
        document: Value,
    ) -> Result<u64, Error> {
        self.check_available()?;
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_replaces.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.inner
            .conditional_replace(collection, filter, document)
            .await
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Value>, Error> {
        self.check_available()?;
        let snapshot = self.inner.scan(collection).await?;
        let pending = {
            let mut pending = self.write_after_scan.lock().unwrap();
            match pending.as_ref() {
                Some((target, _)) if target == collection => pending.take(),
                _ => None,
            }
        };
        if let Some((_, document)) = pending {
            let id = crate::driver::document_id(collection, &document)?.to_string();
            self.inner
                .conditional_replace(collection, &ReplaceFilter::by_id(id), document)
                .await?;
        }
        Ok(snapshot)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, Error> {
        self.check_available()?;
        self.inner.list_indexes(collection).await
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<String, Error> {
        self.check_available()?;
        self.create_index_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_indexes.lock().unwrap().contains(&spec.name) {
            return Err(Error::Unavailable {
                message: format!("injected failure creating {}", spec.name),
            });
        }
        self.inner.create_index(collection, spec).await
    }
}
