//! The driver module centralizes the logic for
//! reading and writing documents in the state store.
//!
//! Every component above this layer talks to a `DocumentStore`, a small
//! collection-oriented interface with exactly the primitives schema
//! management needs: lookup by id, insert-if-absent, a conditional replace
//! keyed on `(_id, revision)`, full scans and index management.
//!
//! Two drivers implement it: `InMemoryDriver` for tests and ephemeral
//! deployments, and `RocksDBDriver` for persistent ones.

use std::sync::Arc;

use async_trait::async_trait;
use data_model::{IndexInfo, IndexSpec, ID_FIELD, REVISION_FIELD};
use serde_json::Value;

pub mod memory;
pub mod rocksdb;

pub use memory::InMemoryDriver;
pub use rocksdb::RocksDBDriver;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Document in collection {collection} has no string `_id` field")]
    MissingDocumentId { collection: String },

    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error(
        "Duplicate key violates unique index. collection: {collection}, index: {index}, document: {id}"
    )]
    DuplicateKey {
        collection: String,
        index: String,
        id: String,
    },

    #[error("Document store is unavailable: {message}")]
    Unavailable { message: String },

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: rocksdb::Error,
    },
}

impl Error {
    /// Identifies writes rejected because of a unique index.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(&self, Self::DuplicateKey { .. })
    }
}

/// Result of `DocumentStore::insert_if_absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Selects the document a conditional replace applies to.
///
/// With `revision` set the replace only matches while the stored document
/// still carries that revision. A stored document without a `revision`
/// field is treated as revision 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceFilter {
    pub id: String,
    pub revision: Option<u64>,
}

impl ReplaceFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
        }
    }

    pub fn by_revision(id: impl Into<String>, revision: u64) -> Self {
        Self {
            id: id.into(),
            revision: Some(revision),
        }
    }

    pub fn matches(&self, stored: &Value) -> bool {
        match self.revision {
            Some(revision) => document_revision(stored) == revision,
            None => true,
        }
    }
}

/// The operations schema management needs from a document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the document with the given `_id`, if any.
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, Error>;

    /// Inserts `document` unless a document with the same `_id` exists.
    ///
    /// Violating a unique secondary index is an error, not
    /// `AlreadyExists`.
    async fn insert_if_absent(
        &self,
        collection: &str,
        document: Value,
    ) -> Result<InsertOutcome, Error>;

    /// Replaces the document selected by `filter` and returns the number of
    /// matched documents (0 or 1).
    async fn conditional_replace(
        &self,
        collection: &str,
        filter: &ReplaceFilter,
        document: Value,
    ) -> Result<u64, Error>;

    /// Returns every document of the collection ordered by `_id`.
    async fn scan(&self, collection: &str) -> Result<Vec<Value>, Error>;

    /// Lists the indexes of the collection, the primary key index included.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, Error>;

    /// Creates the index, replacing an existing definition with the same
    /// name, and returns its name. Fails with `DuplicateKey` when existing
    /// documents violate a unique index.
    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<String, Error>;
}

/// Multiple options to configure different database drivers.
#[non_exhaustive]
pub enum ConnectionOptions {
    RocksDB(rocksdb::Options),
    InMemory,
}

/// Open a connection to a document store.
pub fn open_database(options: ConnectionOptions) -> Result<Arc<dyn DocumentStore>, Error> {
    match options {
        ConnectionOptions::RocksDB(options) => Ok(Arc::new(RocksDBDriver::open(options)?)),
        ConnectionOptions::InMemory => Ok(Arc::new(InMemoryDriver::default())),
    }
}

pub fn document_id<'a>(collection: &str, document: &'a Value) -> Result<&'a str, Error> {
    document
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MissingDocumentId {
            collection: collection.to_string(),
        })
}

pub fn document_revision(document: &Value) -> u64 {
    document
        .get(REVISION_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

/// Forces the `_id` of a replacement document to the filtered id.
pub(crate) fn with_id(mut document: Value, id: &str) -> Value {
    if let Value::Object(fields) = &mut document {
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    document
}

/// Resolves a dotted field path such as `labels.stream`.
fn lookup_field<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

/// Computes the key a document contributes to an index.
///
/// Missing fields index as `null`. Sparse indexes skip documents that have
/// none of the indexed fields.
pub(crate) fn index_entry(index: &IndexInfo, document: &Value) -> Option<Vec<Value>> {
    let fields: Vec<Option<&Value>> = index
        .keys
        .iter()
        .map(|key| lookup_field(document, &key.field))
        .collect();
    if index.sparse && fields.iter().all(Option::is_none) {
        return None;
    }
    Some(
        fields
            .into_iter()
            .map(|value| value.cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use data_model::IndexSpec;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_replace_filter_treats_missing_revision_as_zero() {
        let stored = json!({"_id": "a", "value": 1});
        assert!(ReplaceFilter::by_revision("a", 0).matches(&stored));
        assert!(!ReplaceFilter::by_revision("a", 1).matches(&stored));
        assert!(ReplaceFilter::by_id("a").matches(&stored));

        let stored = json!({"_id": "a", "revision": 4});
        assert!(ReplaceFilter::by_revision("a", 4).matches(&stored));
    }

    #[test]
    fn test_index_entry_nested_and_sparse() {
        let index = IndexInfo::from(&IndexSpec::ascending("labels.stream").then_ascending("job"));
        let doc = json!({"_id": "1", "labels": {"stream": "main"}});
        assert_eq!(
            index_entry(&index, &doc),
            Some(vec![json!("main"), Value::Null])
        );

        let sparse = IndexInfo::from(&IndexSpec::ascending("quarantine").sparse());
        assert_eq!(index_entry(&sparse, &json!({"_id": "2"})), None);
        assert_eq!(
            index_entry(&sparse, &json!({"_id": "3", "quarantine": 1})),
            Some(vec![json!(1)])
        );
    }

    #[test]
    fn test_document_id_required() {
        assert_eq!(document_id("jobs", &json!({"_id": "x"})).unwrap(), "x");
        assert!(matches!(
            document_id("jobs", &json!({"_id": 7})),
            Err(Error::MissingDocumentId { .. })
        ));
    }
}
