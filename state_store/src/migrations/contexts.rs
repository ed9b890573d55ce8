use std::sync::Arc;

use anyhow::{Context, Result};
use data_model::REVISION_FIELD;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    driver::{document_id, document_revision, DocumentStore, ReplaceFilter},
    singleton::VersionedSingletonStore,
};

/// Everything a migration step may touch.
pub struct MigrationContext {
    plugin: String,
    version: u32,
    pub store: Arc<dyn DocumentStore>,
    pub singletons: VersionedSingletonStore,
    pub cancel: CancellationToken,
}

impl MigrationContext {
    pub fn new(
        plugin: impl Into<String>,
        version: u32,
        singletons: VersionedSingletonStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            version,
            store: singletons.store().clone(),
            singletons,
            cancel,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Calls `callback` for every document of `collection`.
    pub async fn iterate<F>(&self, collection: &str, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value) -> Result<()> + Send,
    {
        let documents = self
            .store
            .scan(collection)
            .await
            .with_context(|| format!("scanning collection {collection}"))?;
        for document in &documents {
            callback(document)?;
        }
        Ok(())
    }

    /// Rewrites the documents of `collection` in place.
    ///
    /// `transform` returns true for documents it changed; only those are
    /// written back, each guarded by the revision it was read at. A document
    /// written concurrently is read again and transformed anew; one deleted
    /// concurrently is skipped. Returns the number of rewritten documents.
    pub async fn rewrite<F>(&self, collection: &str, mut transform: F) -> Result<usize>
    where
        F: FnMut(&mut Value) -> Result<bool> + Send,
    {
        let documents = self
            .store
            .scan(collection)
            .await
            .with_context(|| format!("scanning collection {collection}"))?;

        let mut rewritten = 0;
        for document in documents {
            let id = document_id(collection, &document)?.to_string();
            let mut current = Some(document);
            while let Some(mut document) = current.take() {
                if self.cancel.is_cancelled() {
                    anyhow::bail!("rewrite of {collection} cancelled");
                }
                let revision = document_revision(&document);
                if !transform(&mut document)? {
                    break;
                }
                document
                    .as_object_mut()
                    .with_context(|| format!("{collection}/{id} is not an object"))?
                    .insert(REVISION_FIELD.to_string(), Value::from(revision + 1));
                let matched = self
                    .store
                    .conditional_replace(
                        collection,
                        &ReplaceFilter::by_revision(&id, revision),
                        document,
                    )
                    .await
                    .with_context(|| format!("rewriting {collection}/{id}"))?;
                if matched > 0 {
                    rewritten += 1;
                    break;
                }
                debug!(collection, id = %id, revision, "document changed during rewrite, reloading");
                current = self
                    .store
                    .find_by_id(collection, &id)
                    .await
                    .with_context(|| format!("reloading {collection}/{id}"))?;
            }
        }

        debug!(
            plugin = %self.plugin,
            version = self.version,
            collection,
            rewritten,
            "rewrote documents"
        );
        Ok(rewritten)
    }
}
