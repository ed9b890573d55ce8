use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use data_model::{IndexInfo, IndexSpec};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    document_id,
    index_entry,
    with_id,
    DocumentStore,
    Error,
    InsertOutcome,
    ReplaceFilter,
};

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: BTreeMap<String, Value>,
    indexes: BTreeMap<String, IndexInfo>,
}

impl MemoryCollection {
    /// Rejects `document` if it collides with another document on a unique
    /// index.
    fn check_unique(&self, collection: &str, id: &str, document: &Value) -> Result<(), Error> {
        for index in self.indexes.values().filter(|index| index.unique) {
            let Some(key) = index_entry(index, document) else {
                continue;
            };
            let collides = self
                .documents
                .iter()
                .filter(|(other_id, _)| other_id.as_str() != id)
                .any(|(_, other)| index_entry(index, other).as_ref() == Some(&key));
            if collides {
                return Err(Error::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Document store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDriver {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, Error> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|c| c.documents.get(id))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        document: Value,
    ) -> Result<InsertOutcome, Error> {
        let id = document_id(collection, &document)?.to_string();
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        if entry.documents.contains_key(&id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        entry.check_unique(collection, &id, &document)?;
        entry.documents.insert(id, document);
        Ok(InsertOutcome::Inserted)
    }

    async fn conditional_replace(
        &self,
        collection: &str,
        filter: &ReplaceFilter,
        document: Value,
    ) -> Result<u64, Error> {
        let mut collections = self.collections.write().await;
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        match entry.documents.get(&filter.id) {
            Some(stored) if filter.matches(stored) => {}
            _ => return Ok(0),
        }
        let document = with_id(document, &filter.id);
        entry.check_unique(collection, &filter.id, &document)?;
        entry.documents.insert(filter.id.clone(), document);
        Ok(1)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Value>, Error> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, Error> {
        let collections = self.collections.read().await;
        let mut indexes = vec![IndexInfo::primary_key()];
        if let Some(entry) = collections.get(collection) {
            indexes.extend(entry.indexes.values().cloned());
        }
        Ok(indexes)
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<String, Error> {
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        let index = IndexInfo::from(spec);

        if index.unique {
            let mut seen: HashMap<String, &str> = HashMap::new();
            for (id, document) in &entry.documents {
                let Some(key) = index_entry(&index, document) else {
                    continue;
                };
                let key = Value::Array(key).to_string();
                if seen.insert(key, id).is_some() {
                    return Err(Error::DuplicateKey {
                        collection: collection.to_string(),
                        index: index.name.clone(),
                        id: id.clone(),
                    });
                }
            }
        }

        entry.indexes.insert(index.name.clone(), index);
        Ok(spec.name.clone())
    }
}
