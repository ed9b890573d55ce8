use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::LeaseDocument;
use schema_utils::get_epoch_time_in_ms;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    driver::{self, DocumentStore, InsertOutcome, ReplaceFilter},
    serializer::{from_document, to_document},
};

/// Collection holding lease documents.
pub const LOCKS_COLLECTION: &str = "locks";

/// Proof of holding a lock until `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    pub expires_at_ms: u64,
}

/// Cross-process mutual exclusion.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lock if nobody holds an unexpired lease on `key`.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, driver::Error>;

    /// Gives the lock back. Releasing a lease that expired and was taken
    /// over by someone else leaves the new holder alone.
    async fn release(&self, lease: &Lease) -> Result<(), driver::Error>;
}

/// Lock backed by a lease document in the `locks` collection.
///
/// Acquisition and release use the same revision-guarded replace the
/// singleton store relies on, so two processes can never both observe a
/// successful acquire of the same lease revision.
#[derive(Clone)]
pub struct DocumentLock {
    store: Arc<dyn DocumentStore>,
}

impl DocumentLock {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DistributedLock for DocumentLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<Option<Lease>, driver::Error> {
        let now = get_epoch_time_in_ms();
        let granted = Lease {
            key: key.to_string(),
            owner: Uuid::new_v4().to_string(),
            expires_at_ms: now.saturating_add(lease.as_millis() as u64),
        };

        let Some(stored) = self.store.find_by_id(LOCKS_COLLECTION, key).await? else {
            let document = to_document(&LeaseDocument {
                key: key.to_string(),
                revision: 0,
                owner: Some(granted.owner.clone()),
                expires_at_ms: granted.expires_at_ms,
            })?;
            return match self.store.insert_if_absent(LOCKS_COLLECTION, document).await? {
                InsertOutcome::Inserted => Ok(Some(granted)),
                InsertOutcome::AlreadyExists => Ok(None),
            };
        };

        let current: LeaseDocument = from_document(stored)?;
        if current.is_held_at(now) {
            debug!(key, owner = ?current.owner, "lock is held");
            return Ok(None);
        }
        if let Some(owner) = &current.owner {
            warn!(key, owner = %owner, "taking over expired lock lease");
        }

        let document = to_document(&LeaseDocument {
            key: key.to_string(),
            revision: current.revision + 1,
            owner: Some(granted.owner.clone()),
            expires_at_ms: granted.expires_at_ms,
        })?;
        let matched = self
            .store
            .conditional_replace(
                LOCKS_COLLECTION,
                &ReplaceFilter::by_revision(key, current.revision),
                document,
            )
            .await?;
        Ok((matched > 0).then_some(granted))
    }

    async fn release(&self, lease: &Lease) -> Result<(), driver::Error> {
        let Some(stored) = self.store.find_by_id(LOCKS_COLLECTION, &lease.key).await? else {
            warn!(key = %lease.key, "released lock has no lease document");
            return Ok(());
        };
        let current: LeaseDocument = from_document(stored)?;
        if current.owner.as_deref() != Some(lease.owner.as_str()) {
            warn!(key = %lease.key, "lock lease was taken over before release");
            return Ok(());
        }

        let document = to_document(&LeaseDocument {
            key: lease.key.clone(),
            revision: current.revision + 1,
            owner: None,
            expires_at_ms: 0,
        })?;
        let matched = self
            .store
            .conditional_replace(
                LOCKS_COLLECTION,
                &ReplaceFilter::by_revision(&lease.key, current.revision),
                document,
            )
            .await?;
        if matched == 0 {
            warn!(key = %lease.key, "lock lease changed while releasing");
        }
        Ok(())
    }
}
