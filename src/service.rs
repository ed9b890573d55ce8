use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Context, Result};
use data_model::SchemaVersionResult;
use state_store::{indexes::ReconcileReport, migrations::MigrationCatalog, SchemaStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::ServerConfig,
    plugins::{self, SchemaPlugin},
};

/// The operator actions of the server, bound to one store and one set of
/// plugins.
pub struct Service {
    config: ServerConfig,
    schema: SchemaStore,
    plugins: Vec<Arc<dyn SchemaPlugin>>,
    catalog: Arc<MigrationCatalog>,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let schema = SchemaStore::open(
            config.state_store.connection_options(),
            config.singleton_retry.policy(),
        )?;
        Self::with_plugins(config, schema, plugins::builtin())
    }

    pub fn with_plugins(
        config: ServerConfig,
        schema: SchemaStore,
        plugins: Vec<Arc<dyn SchemaPlugin>>,
    ) -> Result<Self> {
        let catalog = plugins::catalog(&plugins).context("registering plugin migrations")?;
        Ok(Self {
            config,
            schema,
            plugins,
            catalog: Arc::new(catalog),
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling the token stops the running action at its next
    /// suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True when every plugin is usable by this build once the action is
    /// done: the schema was not behind, or it was and got upgraded.
    pub async fn validate(&self, auto_upgrade: bool) -> Result<bool> {
        let auto_upgrade = auto_upgrade || self.config.auto_upgrade;
        let up_to_date = self
            .schema
            .schema_guard(self.catalog.clone())
            .validate_all(auto_upgrade, &self.cancel)
            .await?;
        Ok(up_to_date || auto_upgrade)
    }

    /// Upgrades one plugin, or all of them when `plugin` is not given.
    pub async fn upgrade(
        &self,
        plugin: Option<&str>,
        to_version: Option<u32>,
    ) -> Result<BTreeMap<String, Option<u32>>> {
        let runner = self.schema.migration_runner(self.catalog.clone());
        match plugin {
            Some(plugin) => {
                let version = runner
                    .upgrade(plugin, to_version, &self.cancel)
                    .await
                    .with_context(|| format!("upgrading plugin {plugin}"))?;
                Ok(BTreeMap::from([(plugin.to_string(), version)]))
            }
            None if to_version.is_some() => {
                bail!("a target version needs a plugin to apply to")
            }
            None => runner
                .upgrade_all(&self.cancel)
                .await
                .context("upgrading plugins"),
        }
    }

    pub async fn downgrade(&self, plugin: &str, to_version: u32) -> Result<Option<u32>> {
        self.schema
            .migration_runner(self.catalog.clone())
            .downgrade(plugin, to_version, &self.cancel)
            .await
            .with_context(|| format!("downgrading plugin {plugin} to v{to_version}"))
    }

    pub async fn status(&self) -> Result<Vec<SchemaVersionResult>> {
        let results = self
            .schema
            .schema_guard(self.catalog.clone())
            .resolver()
            .resolve_all(&self.cancel)
            .await
            .context("resolving plugin schema versions")?;
        Ok(results.into_values().collect())
    }

    /// Reconciles the indexes of every plugin collection, one collection at
    /// a time. `read_only` only adds to the configured mode.
    pub async fn sync_indexes(&self, read_only: bool) -> Result<BTreeMap<String, ReconcileReport>> {
        let mut options = self.config.indexes.sync_options();
        options.read_only |= read_only;
        let synchronizer = self.schema.index_synchronizer(options);

        let mut reports = BTreeMap::new();
        for plugin in &self.plugins {
            for collection in plugin.collections() {
                let report = synchronizer
                    .reconcile(collection.collection, &collection.indexes, &self.cancel)
                    .await
                    .with_context(|| {
                        format!(
                            "reconciling indexes of {} for plugin {}",
                            collection.collection,
                            plugin.name()
                        )
                    })?;
                info!(
                    plugin = plugin.name(),
                    collection = collection.collection,
                    created = report.created.len(),
                    skipped = report.skipped.len(),
                    advisory_removals = report.advisory_removals.len(),
                    "indexes reconciled"
                );
                reports.insert(collection.collection.to_string(), report);
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use data_model::SchemaState;
    use state_store::{driver::ConnectionOptions, singleton::RetryPolicy};

    use super::*;
    use crate::config::StateStoreConfig;

    fn service() -> Service {
        let config = ServerConfig {
            state_store: StateStoreConfig::Memory,
            ..Default::default()
        };
        let schema = SchemaStore::open(ConnectionOptions::InMemory, RetryPolicy::default()).unwrap();
        Service::with_plugins(config, schema, plugins::builtin()).unwrap()
    }

    fn states(results: &[SchemaVersionResult]) -> Vec<(String, SchemaState)> {
        results
            .iter()
            .map(|result| (result.plugin.clone(), result.state))
            .collect()
    }

    #[tokio::test]
    async fn test_validate_then_upgrade() {
        let service = service();
        assert!(!service.validate(false).await.unwrap());
        assert_eq!(
            states(&service.status().await.unwrap()),
            vec![
                ("build".to_string(), SchemaState::DatabaseOutdated),
                ("issues".to_string(), SchemaState::DatabaseOutdated),
            ]
        );

        let versions = service.upgrade(None, None).await.unwrap();
        assert_eq!(versions.get("build"), Some(&Some(2)));
        assert_eq!(versions.get("issues"), Some(&Some(2)));
        assert!(service.validate(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_upgrade_passes_validation() {
        let service = service();
        assert!(service.validate(true).await.unwrap());
        assert!(service
            .status()
            .await
            .unwrap()
            .iter()
            .all(|result| result.state == SchemaState::Match));
    }

    #[tokio::test]
    async fn test_upgrade_and_downgrade_one_plugin() {
        let service = service();
        let versions = service.upgrade(Some("build"), Some(1)).await.unwrap();
        assert_eq!(versions, BTreeMap::from([("build".to_string(), Some(1))]));

        service.upgrade(Some("build"), None).await.unwrap();
        assert_eq!(service.downgrade("build", 0).await.unwrap(), Some(0));

        let status = service.status().await.unwrap();
        let build = status.iter().find(|r| r.plugin == "build").unwrap();
        assert_eq!(build.db_version, Some(0));
        assert_eq!(build.missing_versions(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_target_version_needs_plugin() {
        let err = service().upgrade(None, Some(1)).await.unwrap_err();
        assert!(err.to_string().contains("needs a plugin"));

        let err = service().upgrade(Some("unknown"), None).await.unwrap_err();
        assert!(format!("{err:#}").contains("unknown"));
    }

    #[tokio::test]
    async fn test_sync_indexes() {
        let service = service();

        let preview = service.sync_indexes(true).await.unwrap();
        assert_eq!(preview["jobs"].skipped.len(), 4);
        assert!(preview["jobs"].created.is_empty());

        let reports = service.sync_indexes(false).await.unwrap();
        assert_eq!(reports["jobs"].created.len(), 4);
        assert_eq!(reports["issues.suspects"].created.len(), 3);

        let reports = service.sync_indexes(false).await.unwrap();
        assert!(reports
            .values()
            .all(|report| *report == ReconcileReport::default()));
    }
}
