use std::{collections::BTreeMap, fmt};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Field holding the primary key of every stored document.
pub const ID_FIELD: &str = "_id";

/// Field holding the optimistic concurrency token of versioned documents.
pub const REVISION_FIELD: &str = "revision";

/// Name of the implicit primary key index every collection carries.
pub const PRIMARY_KEY_INDEX: &str = "_id_";

/// Logical id of the document recording the applied version of every
/// plugin.
pub const PLUGIN_SCHEMA_STATE_ID: &str = "plugin-schema-state";

/// Applied schema version per plugin.
///
/// Stored as a singleton document. A plugin missing from `versions` has
/// never had a migration applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSchemaState {
    #[serde(default)]
    pub versions: BTreeMap<String, u32>,
}

impl PluginSchemaState {
    pub fn version(&self, plugin: &str) -> Option<u32> {
        self.versions.get(plugin).copied()
    }
}

/// Envelope around the payload of a singleton document.
///
/// The payload fields are flattened next to `_id` and `revision`, so a
/// document written before revisions existed still decodes with
/// `revision = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonDocument<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> SingletonDocument<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    Ascending,
    Descending,
}

impl IndexOrder {
    fn name_suffix(&self) -> i8 {
        match self {
            IndexOrder::Ascending => 1,
            IndexOrder::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: IndexOrder,
}

impl IndexKey {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: IndexOrder::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: IndexOrder::Descending,
        }
    }
}

/// A secondary index a collection owner expects to exist.
///
/// ```ignore
/// let spec = IndexSpec::ascending("stream_id")
///     .then_descending("create_time")
///     .unique();
/// assert_eq!(spec.name, "stream_id_1_create_time_-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    pub fn new(keys: Vec<IndexKey>) -> Self {
        Self {
            name: derive_index_name(&keys),
            keys,
            unique: false,
            sparse: false,
        }
    }

    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new(vec![IndexKey::ascending(field)])
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::new(vec![IndexKey::descending(field)])
    }

    pub fn then_ascending(self, field: impl Into<String>) -> Self {
        self.push_key(IndexKey::ascending(field))
    }

    pub fn then_descending(self, field: impl Into<String>) -> Self {
        self.push_key(IndexKey::descending(field))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// True if `info` has the same keys and options, ignoring the name.
    pub fn same_definition(&self, info: &IndexInfo) -> bool {
        self.keys == info.keys && self.unique == info.unique && self.sparse == info.sparse
    }

    fn push_key(mut self, key: IndexKey) -> Self {
        // Keep deriving the name until the caller picked one explicitly.
        let derived = self.name == derive_index_name(&self.keys);
        self.keys.push(key);
        if derived {
            self.name = derive_index_name(&self.keys);
        }
        self
    }
}

/// An index as reported by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexInfo {
    pub fn primary_key() -> Self {
        Self {
            name: PRIMARY_KEY_INDEX.to_string(),
            keys: vec![IndexKey::ascending(ID_FIELD)],
            unique: true,
            sparse: false,
        }
    }

    pub fn is_primary_key(&self) -> bool {
        self.name == PRIMARY_KEY_INDEX
    }
}

impl From<&IndexSpec> for IndexInfo {
    fn from(spec: &IndexSpec) -> Self {
        Self {
            name: spec.name.clone(),
            keys: spec.keys.clone(),
            unique: spec.unique,
            sparse: spec.sparse,
        }
    }
}

fn derive_index_name(keys: &[IndexKey]) -> String {
    keys.iter()
        .map(|key| format!("{}_{}", key.field, key.order.name_suffix()))
        .join("_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum SchemaState {
    Match,
    DatabaseOutdated,
    ApplicationOutdated,
}

/// A migration the store and the running code disagree on.
///
/// `name` is `None` for versions this process has no descriptor for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMigration {
    pub version: u32,
    pub name: Option<String>,
}

/// Outcome of comparing a plugin's catalog against its applied version.
///
/// A version of `None` means "no migration registered" for `app_version`
/// and "never applied" for `db_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionResult {
    pub plugin: String,
    pub state: SchemaState,
    pub app_version: Option<u32>,
    pub db_version: Option<u32>,
    pub missing_migrations: Vec<MissingMigration>,
}

impl SchemaVersionResult {
    pub fn missing_versions(&self) -> Vec<u32> {
        self.missing_migrations.iter().map(|m| m.version).collect()
    }
}

impl fmt::Display for SchemaVersionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (application v{}, database v{})",
            self.plugin,
            self.state,
            version_number(self.app_version),
            version_number(self.db_version)
        )?;
        if !self.missing_migrations.is_empty() {
            let missing = self
                .missing_migrations
                .iter()
                .map(|m| match &m.name {
                    Some(name) => format!("v{} {}", m.version, name),
                    None => format!("v{} <unknown>", m.version),
                })
                .join(", ");
            write!(f, " missing [{missing}]")?;
        }
        Ok(())
    }
}

/// Flattens an optional version into the `-1 = unset` convention used in
/// logs and operator output.
pub fn version_number(version: Option<u32>) -> i64 {
    version.map(i64::from).unwrap_or(-1)
}

/// Lease record backing the distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDocument {
    #[serde(rename = "_id")]
    pub key: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub expires_at_ms: u64,
}

impl LeaseDocument {
    pub fn is_held_at(&self, now_ms: u64) -> bool {
        self.owner.is_some() && self.expires_at_ms > now_ms
    }
}
