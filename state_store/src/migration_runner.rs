use std::{collections::BTreeMap, sync::Arc};

use data_model::{version_number, PluginSchemaState};
use futures::future::join_all;
use metrics::{SchemaMetrics, Timer};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    migrations::{
        contexts::MigrationContext,
        error::{Error, Operation},
        migration_trait::MigrationDescriptor,
        registry::MigrationCatalog,
    },
    singleton::VersionedSingletonStore,
};

/// Moves plugins forward or backward through their migration ledgers.
///
/// Steps run one at a time. The applied version is persisted after every
/// step, so a failure leaves the store at the last step that succeeded.
#[derive(Clone)]
pub struct MigrationRunner {
    catalog: Arc<MigrationCatalog>,
    singletons: VersionedSingletonStore,
    metrics: Arc<SchemaMetrics>,
}

impl MigrationRunner {
    pub fn new(
        catalog: Arc<MigrationCatalog>,
        singletons: VersionedSingletonStore,
        metrics: Arc<SchemaMetrics>,
    ) -> Self {
        Self {
            catalog,
            singletons,
            metrics,
        }
    }

    pub fn catalog(&self) -> &Arc<MigrationCatalog> {
        &self.catalog
    }

    pub async fn applied_version(
        &self,
        plugin: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>, Error> {
        let state = self.singletons.get::<PluginSchemaState>(cancel).await?;
        Ok(state.payload.version(plugin))
    }

    /// Applies the pending migrations of `plugin` up to `to_version`, or to
    /// the latest one. Returns the version the plugin ends at.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn upgrade(
        &self,
        plugin: &str,
        to_version: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>, Error> {
        self.catalog.validate(plugin)?;

        let mut applied = self.applied_version(plugin, cancel).await?;
        let pending = self.catalog.find_migrations(plugin, applied, to_version);
        if pending.is_empty() {
            info!(
                "Plugin {} already at version {}. No migrations needed.",
                plugin,
                version_number(applied)
            );
            return Ok(applied);
        }

        let target = pending.last().map(|m| m.version).unwrap_or_default();
        info!(
            "Starting migrations of {} from v{} to v{}",
            plugin,
            version_number(applied),
            target
        );

        for descriptor in pending {
            info!(
                "Running migration {}: v{} → v{}",
                descriptor.name,
                version_number(applied),
                descriptor.version
            );
            self.execute(&descriptor, Operation::Apply, cancel).await?;
            self.record_version(plugin, descriptor.version, Operation::Apply, cancel)
                .await?;
            applied = Some(descriptor.version);
        }

        info!(
            "Completed migrations of {}. Database now at version {}",
            plugin, target
        );
        Ok(applied)
    }

    /// Reverts the applied migrations of `plugin` above `to_version`,
    /// newest first. Returns the version the plugin ends at.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn downgrade(
        &self,
        plugin: &str,
        to_version: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>, Error> {
        self.catalog.validate(plugin)?;

        let mut applied = self.applied_version(plugin, cancel).await?;
        let latest = self.catalog.latest_version(plugin);
        if let Some(current) = applied {
            if current > to_version && Some(current) > latest {
                // Steps above `latest` were applied by a newer build.
                return Err(Error::UnknownAppliedVersion {
                    plugin: plugin.to_string(),
                    applied: current,
                    latest: version_number(latest),
                });
            }
        }
        let mut to_revert = match applied {
            Some(current) => self
                .catalog
                .find_migrations(plugin, Some(to_version), Some(current)),
            None => Vec::new(),
        };
        if to_revert.is_empty() {
            info!(
                "Plugin {} at version {}. Nothing to revert to v{}.",
                plugin,
                version_number(applied),
                to_version
            );
            return Ok(applied);
        }
        to_revert.reverse();

        for descriptor in to_revert {
            let target = descriptor.version - 1;
            info!(
                "Reverting migration {}: v{} → v{}",
                descriptor.name, descriptor.version, target
            );
            self.execute(&descriptor, Operation::Revert, cancel).await?;
            self.record_version(plugin, target, Operation::Revert, cancel)
                .await?;
            applied = Some(target);
        }

        info!(
            "Completed downgrade of {}. Database now at version {}",
            plugin,
            version_number(applied)
        );
        Ok(applied)
    }

    /// Upgrades every registered plugin concurrently.
    ///
    /// A failing plugin does not stop the others. When any failed, the first
    /// failure is returned once all of them finished.
    pub async fn upgrade_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, Option<u32>>, Error> {
        let plugins: Vec<&str> = self.catalog.plugins().collect();
        let results = join_all(plugins.iter().map(|plugin| async move {
            (plugin.to_string(), self.upgrade(plugin, None, cancel).await)
        }))
        .await;

        let mut versions = BTreeMap::new();
        let mut first_error = None;
        for (plugin, result) in results {
            match result {
                Ok(version) => {
                    versions.insert(plugin, version);
                }
                Err(err) => {
                    error!(plugin = %plugin, "upgrade failed: {err}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(versions),
        }
    }

    async fn execute(
        &self,
        descriptor: &MigrationDescriptor,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let labels = [
            KeyValue::new("plugin", descriptor.plugin.clone()),
            KeyValue::new("operation", operation.to_string()),
        ];
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                plugin: descriptor.plugin.clone(),
            });
        }
        let _timer = Timer::start_with_labels(&self.metrics.migration_duration, &labels);

        let ctx = MigrationContext::new(
            descriptor.plugin.clone(),
            descriptor.version,
            self.singletons.clone(),
            cancel.child_token(),
        );
        let step = match operation {
            Operation::Apply => descriptor.migration.apply(&ctx),
            Operation::Revert => descriptor.migration.revert(&ctx),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled {
                    plugin: descriptor.plugin.clone(),
                });
            }
            result = step => result,
        };

        match result {
            Ok(()) => {
                match operation {
                    Operation::Apply => self.metrics.migrations_applied.add(1, &labels),
                    Operation::Revert => self.metrics.migrations_reverted.add(1, &labels),
                }
                Ok(())
            }
            Err(source) => {
                self.metrics.migration_failures.add(1, &labels);
                error!(
                    plugin = %descriptor.plugin,
                    version = descriptor.version,
                    "Migration {} failed to {}: {:#}",
                    descriptor.name,
                    operation,
                    source
                );
                Err(Error::MigrationExecution {
                    plugin: descriptor.plugin.clone(),
                    version: descriptor.version,
                    name: descriptor.name.clone(),
                    operation,
                    source,
                })
            }
        }
    }

    /// Persists the version a step moved `plugin` to.
    ///
    /// An apply never lowers a version another process already raised.
    async fn record_version(
        &self,
        plugin: &str,
        version: u32,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.singletons
            .update(
                |state: &mut PluginSchemaState| {
                    let current = state.version(plugin);
                    let unchanged = match operation {
                        Operation::Apply => current >= Some(version),
                        Operation::Revert => current == Some(version),
                    };
                    if unchanged {
                        return false;
                    }
                    state.versions.insert(plugin.to_string(), version);
                    true
                },
                cancel,
            )
            .await?;
        Ok(())
    }
}
