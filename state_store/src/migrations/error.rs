use crate::singleton;

/// Direction a migration step ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Apply,
    Revert,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid migration {plugin} v{version} {name:?}: {reason}")]
    InvalidDescriptor {
        plugin: String,
        version: u32,
        name: String,
        reason: String,
    },

    #[error("plugin {plugin} already registered v{version} as {existing:?}")]
    DuplicateVersion {
        plugin: String,
        version: u32,
        existing: String,
    },

    #[error("no migrations registered for plugin {plugin}")]
    UnknownPlugin { plugin: String },

    #[error("migrations of plugin {plugin} start at v{lowest}, expected v1")]
    MissingVersionOne { plugin: String, lowest: u32 },

    #[error("migrations of plugin {plugin} skip v{missing}")]
    VersionGap { plugin: String, missing: u32 },

    #[error("failed to {operation} migration {plugin} v{version} ({name}): {source:#}")]
    MigrationExecution {
        plugin: String,
        version: u32,
        name: String,
        operation: Operation,
        source: anyhow::Error,
    },

    #[error(
        "plugin {plugin} is at v{applied} but this build only knows migrations up to v{latest}"
    )]
    UnknownAppliedVersion {
        plugin: String,
        applied: u32,
        latest: i64,
    },

    #[error("migrations of plugin {plugin} were cancelled")]
    Cancelled { plugin: String },

    #[error(transparent)]
    Singleton(#[from] singleton::Error),
}

impl Error {
    /// True for errors raised by catalog validation rather than by running
    /// a step.
    pub fn is_catalog_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDescriptor { .. }
                | Self::DuplicateVersion { .. }
                | Self::UnknownPlugin { .. }
                | Self::MissingVersionOne { .. }
                | Self::VersionGap { .. }
        )
    }
}
