use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{
    contexts::MigrationContext,
    migration_trait::{Migration, MigrationDescriptor},
    registry::MigrationCatalog,
};

pub struct NoopMigration;

#[async_trait]
impl Migration for NoopMigration {
    async fn apply(&self, _ctx: &MigrationContext) -> Result<()> {
        Ok(())
    }

    async fn revert(&self, _ctx: &MigrationContext) -> Result<()> {
        Ok(())
    }
}

/// Catalog with a no-op migration named `{plugin} step {v}` per version.
pub fn noop_catalog(plugin: &str, versions: impl IntoIterator<Item = u32>) -> MigrationCatalog {
    let mut catalog = MigrationCatalog::new();
    for version in versions {
        catalog
            .register(MigrationDescriptor::new(
                plugin,
                version,
                format!("{plugin} step {version}"),
                NoopMigration,
            ))
            .unwrap();
    }
    catalog
}

/// Shared, ordered record of the steps that ran.
pub type StepLog = Arc<Mutex<Vec<String>>>;

/// Appends `apply {plugin} v{n}` / `revert {plugin} v{n}` to a log.
pub struct RecordingMigration {
    pub log: StepLog,
    pub fail_apply: bool,
}

#[async_trait]
impl Migration for RecordingMigration {
    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        if self.fail_apply {
            bail!("step {} refused to apply", ctx.version());
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("apply {} v{}", ctx.plugin(), ctx.version()));
        Ok(())
    }

    async fn revert(&self, ctx: &MigrationContext) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("revert {} v{}", ctx.plugin(), ctx.version()));
        Ok(())
    }
}

/// Registers recording migrations for `versions`, the one at `failing`
/// refusing to apply.
pub fn register_recording(
    catalog: &mut MigrationCatalog,
    plugin: &str,
    versions: impl IntoIterator<Item = u32>,
    failing: Option<u32>,
    log: &StepLog,
) {
    for version in versions {
        catalog
            .register(MigrationDescriptor::new(
                plugin,
                version,
                format!("{plugin} step {version}"),
                RecordingMigration {
                    log: log.clone(),
                    fail_apply: failing == Some(version),
                },
            ))
            .unwrap();
    }
}

pub fn logged_steps(log: &StepLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Never finishes on its own.
pub struct StalledMigration;

#[async_trait]
impl Migration for StalledMigration {
    async fn apply(&self, _ctx: &MigrationContext) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
