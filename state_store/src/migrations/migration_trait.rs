use std::{fmt, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::contexts::MigrationContext;

/// Trait defining the body of a database migration
#[async_trait]
pub trait Migration: Send + Sync {
    /// Apply migration using provided context
    async fn apply(&self, ctx: &MigrationContext) -> Result<()>;

    /// Undo what `apply` did. Migrations that cannot be undone keep the
    /// default, which fails the downgrade at this step.
    async fn revert(&self, ctx: &MigrationContext) -> Result<()> {
        bail!(
            "migration {} v{} cannot be reverted",
            ctx.plugin(),
            ctx.version()
        )
    }
}

/// A migration registered for one plugin at one version.
#[derive(Clone)]
pub struct MigrationDescriptor {
    pub plugin: String,
    /// The version this migration upgrades TO
    pub version: u32,
    /// Name for logging purposes
    pub name: String,
    pub migration: Arc<dyn Migration>,
}

impl MigrationDescriptor {
    pub fn new(
        plugin: impl Into<String>,
        version: u32,
        name: impl Into<String>,
        migration: impl Migration + 'static,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            version,
            name: name.into(),
            migration: Arc::new(migration),
        }
    }
}

impl fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("plugin", &self.plugin)
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
