use std::collections::{btree_map::Entry, BTreeMap};

use super::{error::Error, migration_trait::MigrationDescriptor};

pub const MIN_VERSION: u32 = 1;
pub const MAX_VERSION: u32 = 50_000;
pub const MIN_NAME_LENGTH: usize = 4;
pub const MAX_NAME_LENGTH: usize = 200;

/// Registry of the migrations of every plugin.
///
/// Registration enforces the per-descriptor rules. Contiguity of a
/// plugin's versions is only checked by `validate`, right before running.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    ledgers: BTreeMap<String, BTreeMap<u32, MigrationDescriptor>>,
}

impl MigrationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new migration
    pub fn register(&mut self, descriptor: MigrationDescriptor) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidDescriptor {
            plugin: descriptor.plugin.clone(),
            version: descriptor.version,
            name: descriptor.name.clone(),
            reason,
        };
        if !(MIN_VERSION..=MAX_VERSION).contains(&descriptor.version) {
            return Err(invalid(format!(
                "version must be between {MIN_VERSION} and {MAX_VERSION}"
            )));
        }
        let name_length = descriptor.name.chars().count();
        if !(MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&name_length) {
            return Err(invalid(format!(
                "name must be between {MIN_NAME_LENGTH} and {MAX_NAME_LENGTH} characters"
            )));
        }

        let ledger = self.ledgers.entry(descriptor.plugin.clone()).or_default();
        match ledger.entry(descriptor.version) {
            Entry::Occupied(existing) => Err(Error::DuplicateVersion {
                plugin: descriptor.plugin.clone(),
                version: descriptor.version,
                existing: existing.get().name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = MigrationDescriptor>,
    ) -> Result<(), Error> {
        descriptors
            .into_iter()
            .try_for_each(|descriptor| self.register(descriptor))
    }

    /// Plugins with at least one registered migration.
    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.ledgers.keys().map(String::as_str)
    }

    fn ledger(&self, plugin: &str) -> Result<&BTreeMap<u32, MigrationDescriptor>, Error> {
        self.ledgers
            .get(plugin)
            .filter(|ledger| !ledger.is_empty())
            .ok_or_else(|| Error::UnknownPlugin {
                plugin: plugin.to_string(),
            })
    }

    /// The migrations of `plugin` in ascending version order.
    pub fn list_migrations(&self, plugin: &str) -> Result<Vec<MigrationDescriptor>, Error> {
        Ok(self.ledger(plugin)?.values().cloned().collect())
    }

    /// Checks that the versions of `plugin` are exactly `1..=N`.
    pub fn validate(&self, plugin: &str) -> Result<(), Error> {
        let ledger = self.ledger(plugin)?;
        let mut expected = MIN_VERSION;
        for &version in ledger.keys() {
            if version != expected {
                return Err(if expected == MIN_VERSION {
                    Error::MissingVersionOne {
                        plugin: plugin.to_string(),
                        lowest: version,
                    }
                } else {
                    Error::VersionGap {
                        plugin: plugin.to_string(),
                        missing: expected,
                    }
                });
            }
            expected += 1;
        }
        Ok(())
    }

    /// Get the latest migration version
    pub fn latest_version(&self, plugin: &str) -> Option<u32> {
        self.ledgers
            .get(plugin)
            .and_then(|ledger| ledger.keys().next_back().copied())
    }

    pub fn get(&self, plugin: &str, version: u32) -> Option<&MigrationDescriptor> {
        self.ledgers.get(plugin)?.get(&version)
    }

    /// Migrations of `plugin` with `after < version <= up_to`, ascending.
    ///
    /// `after = None` starts at the first migration and `up_to = None` runs
    /// to the last one.
    pub fn find_migrations(
        &self,
        plugin: &str,
        after: Option<u32>,
        up_to: Option<u32>,
    ) -> Vec<MigrationDescriptor> {
        let Some(ledger) = self.ledgers.get(plugin) else {
            return Vec::new();
        };
        ledger
            .values()
            .filter(|m| Some(m.version) > after)
            .filter(|m| up_to.map_or(true, |up_to| m.version <= up_to))
            .cloned()
            .collect()
    }
}
