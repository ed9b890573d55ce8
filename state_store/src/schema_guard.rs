use anyhow::{Context, Result};
use data_model::SchemaState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{migration_runner::MigrationRunner, migrations::resolver::SchemaVersionResolver};

/// Startup check of every plugin's schema version.
#[derive(Clone)]
pub struct SchemaGuard {
    resolver: SchemaVersionResolver,
    runner: MigrationRunner,
}

impl SchemaGuard {
    pub fn new(resolver: SchemaVersionResolver, runner: MigrationRunner) -> Self {
        Self { resolver, runner }
    }

    pub fn resolver(&self) -> &SchemaVersionResolver {
        &self.resolver
    }

    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }

    /// Reports the skew of every plugin and optionally upgrades.
    ///
    /// Returns false if any plugin's database was behind this build, even
    /// when `auto_upgrade` then brought it up to date. A database ahead of
    /// this build is expected during rolling deployments and only warned
    /// about.
    pub async fn validate_all(&self, auto_upgrade: bool, cancel: &CancellationToken) -> Result<bool> {
        let results = self
            .resolver
            .resolve_all(cancel)
            .await
            .context("resolving plugin schema versions")?;

        let mut database_outdated = false;
        for result in results.values() {
            match result.state {
                SchemaState::Match => {
                    info!(plugin = %result.plugin, "schema up to date: {result}");
                }
                SchemaState::DatabaseOutdated => {
                    database_outdated = true;
                    if auto_upgrade {
                        warn!(plugin = %result.plugin, "database schema outdated, upgrading: {result}");
                    } else {
                        error!(plugin = %result.plugin, "database schema outdated: {result}");
                    }
                }
                SchemaState::ApplicationOutdated => {
                    warn!(
                        plugin = %result.plugin,
                        "database schema is newer than this build: {result}"
                    );
                }
            }
        }

        if auto_upgrade {
            self.runner
                .upgrade_all(cancel)
                .await
                .context("upgrading plugin schemas")?;
        }

        Ok(!database_outdated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use data_model::PluginSchemaState;
    use metrics::SchemaMetrics;

    use super::*;
    use crate::{
        driver::{DocumentStore, InMemoryDriver},
        migrations::{
            registry::MigrationCatalog,
            testing::{logged_steps, register_recording, StepLog},
        },
        singleton::VersionedSingletonStore,
    };

    fn guard(catalog: MigrationCatalog) -> (SchemaGuard, VersionedSingletonStore) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDriver::new());
        let metrics = Arc::new(SchemaMetrics::new());
        let singletons = VersionedSingletonStore::new(store, metrics.clone());
        let catalog = Arc::new(catalog);
        let guard = SchemaGuard::new(
            SchemaVersionResolver::new(catalog.clone(), singletons.clone()),
            MigrationRunner::new(catalog, singletons.clone(), metrics),
        );
        (guard, singletons)
    }

    #[tokio::test]
    async fn test_outdated_database_fails_validation() {
        let log = StepLog::default();
        let mut catalog = MigrationCatalog::new();
        register_recording(&mut catalog, "build", 1..=2, None, &log);
        let (guard, _) = guard(catalog);
        let cancel = CancellationToken::new();

        assert!(!guard.validate_all(false, &cancel).await.unwrap());
        assert!(logged_steps(&log).is_empty());

        // Auto-upgrade still reports the outdated state it started from.
        assert!(!guard.validate_all(true, &cancel).await.unwrap());
        assert_eq!(logged_steps(&log).len(), 2);

        assert!(guard.validate_all(false, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_database_passes() {
        let log = StepLog::default();
        let mut catalog = MigrationCatalog::new();
        register_recording(&mut catalog, "build", 1..=2, None, &log);
        let (guard, singletons) = guard(catalog);
        let cancel = CancellationToken::new();
        singletons
            .update(
                |state: &mut PluginSchemaState| {
                    state.versions.insert("build".to_string(), 4);
                    true
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(guard.validate_all(true, &cancel).await.unwrap());
        assert!(logged_steps(&log).is_empty());
    }

    #[tokio::test]
    async fn test_failed_auto_upgrade_is_an_error() {
        let log = StepLog::default();
        let mut catalog = MigrationCatalog::new();
        register_recording(&mut catalog, "build", 1..=2, Some(1), &log);
        let (guard, _) = guard(catalog);

        let err = guard
            .validate_all(true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("build step 1"));
    }
}
