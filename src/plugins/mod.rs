//! Built-in plugins of the server.
//!
//! A plugin owns a set of collections: it ships the migrations that evolve
//! their documents and declares the secondary indexes the running code
//! expects on them.

use std::sync::Arc;

use data_model::IndexSpec;
use state_store::migrations::{self, MigrationCatalog, MigrationDescriptor};

pub mod build;
pub mod issues;

/// Indexes the running code expects on one collection.
#[derive(Debug, Clone)]
pub struct CollectionIndexes {
    pub collection: &'static str,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionIndexes {
    pub fn new(collection: &'static str, indexes: Vec<IndexSpec>) -> Self {
        Self {
            collection,
            indexes,
        }
    }
}

pub trait SchemaPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// The migration ledger of this plugin.
    fn migrations(&self) -> Vec<MigrationDescriptor>;

    fn collections(&self) -> Vec<CollectionIndexes>;
}

pub fn builtin() -> Vec<Arc<dyn SchemaPlugin>> {
    vec![Arc::new(build::BuildPlugin), Arc::new(issues::IssuesPlugin)]
}

/// Registers the migrations of every plugin into one catalog.
pub fn catalog(plugins: &[Arc<dyn SchemaPlugin>]) -> Result<MigrationCatalog, migrations::Error> {
    let mut catalog = MigrationCatalog::new();
    for plugin in plugins {
        catalog.register_all(plugin.migrations())?;
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_builtin_ledgers_are_contiguous() {
        let plugins = builtin();
        let catalog = catalog(&plugins).unwrap();
        for plugin in &plugins {
            catalog.validate(plugin.name()).unwrap();
            for descriptor in catalog.list_migrations(plugin.name()).unwrap() {
                assert_eq!(descriptor.plugin, plugin.name());
            }
        }
    }

    #[test]
    fn test_index_names_unique_per_collection() {
        for plugin in builtin() {
            for collection in plugin.collections() {
                let names: HashSet<_> = collection.indexes.iter().map(|i| &i.name).collect();
                assert_eq!(
                    names.len(),
                    collection.indexes.len(),
                    "{}",
                    collection.collection
                );
            }
        }
    }
}
