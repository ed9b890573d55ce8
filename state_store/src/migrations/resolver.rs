use std::{collections::BTreeMap, sync::Arc};

use data_model::{MissingMigration, PluginSchemaState, SchemaState, SchemaVersionResult};
use tokio_util::sync::CancellationToken;

use super::registry::MigrationCatalog;
use crate::singleton::{self, VersionedSingletonStore};

/// Compares what the running code ships against what the store has applied.
#[derive(Clone)]
pub struct SchemaVersionResolver {
    catalog: Arc<MigrationCatalog>,
    singletons: VersionedSingletonStore,
}

impl SchemaVersionResolver {
    pub fn new(catalog: Arc<MigrationCatalog>, singletons: VersionedSingletonStore) -> Self {
        Self {
            catalog,
            singletons,
        }
    }

    pub async fn resolve(
        &self,
        plugin: &str,
        cancel: &CancellationToken,
    ) -> Result<SchemaVersionResult, singleton::Error> {
        let state = self.singletons.get::<PluginSchemaState>(cancel).await?;
        Ok(classify(&self.catalog, plugin, state.payload.version(plugin)))
    }

    /// Resolves every plugin with at least one registered migration against
    /// a single read of the applied versions.
    pub async fn resolve_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, SchemaVersionResult>, singleton::Error> {
        let state = self.singletons.get::<PluginSchemaState>(cancel).await?;
        Ok(self
            .catalog
            .plugins()
            .map(|plugin| {
                let result = classify(&self.catalog, plugin, state.payload.version(plugin));
                (plugin.to_string(), result)
            })
            .collect())
    }
}

/// Classifies the skew between the catalog of `plugin` and `db_version`.
pub fn classify(
    catalog: &MigrationCatalog,
    plugin: &str,
    db_version: Option<u32>,
) -> SchemaVersionResult {
    let app_version = catalog.latest_version(plugin);

    let (state, missing_migrations) = if app_version == db_version {
        (SchemaState::Match, Vec::new())
    } else if app_version > db_version {
        let missing = catalog
            .find_migrations(plugin, db_version, app_version)
            .into_iter()
            .map(|m| MissingMigration {
                version: m.version,
                name: Some(m.name),
            })
            .collect();
        (SchemaState::DatabaseOutdated, missing)
    } else {
        // Applied by newer code; this build has no descriptors for them.
        let first_unknown = app_version.map_or(1, |v| v + 1);
        let missing = (first_unknown..=db_version.unwrap_or_default())
            .map(|version| MissingMigration {
                version,
                name: None,
            })
            .collect();
        (SchemaState::ApplicationOutdated, missing)
    };

    SchemaVersionResult {
        plugin: plugin.to_string(),
        state,
        app_version,
        db_version,
        missing_migrations,
    }
}
