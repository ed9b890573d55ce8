use std::path::PathBuf;

use async_trait::async_trait;
use data_model::{IndexInfo, IndexSpec};
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    Error as RocksDBError,
    IteratorMode,
    Options as RocksDBOptions,
    Transaction,
    TransactionDB,
    TransactionDBOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, IntoEnumIterator};
use tracing::{debug, info};

use crate::{
    driver::{
        document_id,
        index_entry,
        with_id,
        DocumentStore,
        Error as DriverError,
        InsertOutcome,
        ReplaceFilter,
    },
    serializer::{JsonEncode, JsonEncoder},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open RocksDB database. error: {}", source)]
    OpenDatabaseFailed { source: RocksDBError },

    #[error("Column family {name} is not open")]
    MissingColumnFamily { name: String },

    #[error(transparent)]
    GenericRocksDBFailure { source: RocksDBError },
}

impl Error {
    fn into_generic(source: RocksDBError) -> DriverError {
        Self::GenericRocksDBFailure { source }.into()
    }
}

/// Column families of the document store.
///
/// Documents are keyed `{collection}\0{_id}`, index definitions
/// `{collection}\0{index}`. Only unique indexes keep entries, keyed
/// `{collection}\0{index}\0{key}` with the owning document id as value.
/// The bare `{collection}` key of `Indexes` is never written; transactions
/// lock it to order document writes against index builds.
#[derive(AsRefStr, strum::Display, strum::EnumIter, Debug, Clone, Copy)]
pub enum StoreColumns {
    Documents,
    Indexes,
    IndexEntries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocksDBConfig {
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
    /// How long a transaction waits for a row lock held by another one.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: i64,
}

fn default_max_open_files() -> i32 {
    -1
}

fn default_lock_timeout_ms() -> i64 {
    5_000
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            max_open_files: default_max_open_files(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Options to start a connection with RocksDB.
#[derive(Debug, Clone)]
pub struct Options {
    pub path: PathBuf,
    pub config: RocksDBConfig,
}

/// Driver storing documents in a RocksDB transaction database.
pub struct RocksDBDriver {
    db: TransactionDB,
}

impl RocksDBDriver {
    /// Open a new connection with a RocksDB database.
    pub fn open(driver_options: Options) -> Result<RocksDBDriver, Error> {
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        db_opts.set_max_open_files(driver_options.config.max_open_files);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(driver_options.config.lock_timeout_ms);

        let column_families = StoreColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), RocksDBOptions::default()));

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &txn_opts,
            &driver_options.path,
            column_families,
        )
        .map_err(|source| Error::OpenDatabaseFailed { source })?;

        info!(path = %driver_options.path.display(), "opened rocksdb document store");
        Ok(RocksDBDriver { db })
    }

    fn column_family(&self, column: StoreColumns) -> Result<&ColumnFamily, DriverError> {
        self.db.cf_handle(column.as_ref()).ok_or_else(|| {
            Error::MissingColumnFamily {
                name: column.to_string(),
            }
            .into()
        })
    }

    /// Collects the committed key/value pairs starting with `prefix`.
    fn scan_prefix(
        &self,
        column: StoreColumns,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, DriverError> {
        let cf = self.column_family(column)?;
        let mut items = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(Error::into_generic)?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    fn load_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DriverError> {
        self.scan_prefix(StoreColumns::Indexes, &collection_prefix(collection))?
            .into_iter()
            .map(|(_, value)| {
                JsonEncoder::decode::<IndexInfo>(&value)
                    .map_err(|source| DriverError::JsonDecoderFailed { source })
            })
            .collect()
    }

    fn get_for_update(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        column: StoreColumns,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let cf = self.column_family(column)?;
        txn.get_for_update_cf(cf, key, true)
            .map_err(Error::into_generic)
    }

    /// Document writes lock their collection shared, index builds
    /// exclusively, so no write slips between an index build's scan and
    /// its commit.
    fn lock_collection(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        collection: &str,
        exclusive: bool,
    ) -> Result<(), DriverError> {
        let cf = self.column_family(StoreColumns::Indexes)?;
        txn.get_for_update_cf(cf, collection.as_bytes(), exclusive)
            .map_err(Error::into_generic)?;
        Ok(())
    }

    fn put_index_entry(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        collection: &str,
        index: &IndexInfo,
        entry: &[Value],
        id: &str,
    ) -> Result<(), DriverError> {
        let key = index_entry_key(collection, index, entry);
        if let Some(owner) = self.get_for_update(txn, StoreColumns::IndexEntries, &key)? {
            if owner != id.as_bytes() {
                return Err(DriverError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    id: id.to_string(),
                });
            }
        }
        let cf = self.column_family(StoreColumns::IndexEntries)?;
        txn.put_cf(cf, key, id.as_bytes())
            .map_err(Error::into_generic)
    }

    /// Stages `document` and moves its index entries away from `previous`.
    fn stage_document(
        &self,
        txn: &Transaction<'_, TransactionDB>,
        collection: &str,
        id: &str,
        previous: Option<&Value>,
        document: &Value,
    ) -> Result<(), DriverError> {
        self.lock_collection(txn, collection, false)?;
        let entries_cf = self.column_family(StoreColumns::IndexEntries)?;
        // Nothing reads non-unique entries, so none are kept.
        for index in self.load_indexes(collection)?.into_iter().filter(|i| i.unique) {
            let old_entry = previous.and_then(|previous| index_entry(&index, previous));
            let new_entry = index_entry(&index, document);
            if old_entry == new_entry {
                continue;
            }
            if let Some(old_entry) = old_entry {
                txn.delete_cf(
                    entries_cf,
                    index_entry_key(collection, &index, &old_entry),
                )
                .map_err(Error::into_generic)?;
            }
            if let Some(new_entry) = new_entry {
                self.put_index_entry(txn, collection, &index, &new_entry, id)?;
            }
        }

        let serialized = JsonEncoder::encode(document)
            .map_err(|source| DriverError::JsonEncoderFailed { source })?;
        let documents_cf = self.column_family(StoreColumns::Documents)?;
        txn.put_cf(documents_cf, document_key(collection, id), serialized)
            .map_err(Error::into_generic)
    }

    fn decode_document(bytes: &[u8]) -> Result<Value, DriverError> {
        JsonEncoder::decode(bytes).map_err(|source| DriverError::JsonDecoderFailed { source })
    }

    fn insert_sync(&self, collection: &str, document: Value) -> Result<InsertOutcome, DriverError> {
        let id = document_id(collection, &document)?;
        let txn = self.db.transaction();
        if self
            .get_for_update(&txn, StoreColumns::Documents, &document_key(collection, id))?
            .is_some()
        {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.stage_document(&txn, collection, id, None, &document)?;
        txn.commit().map_err(Error::into_generic)?;
        Ok(InsertOutcome::Inserted)
    }

    fn replace_sync(
        &self,
        collection: &str,
        filter: &ReplaceFilter,
        document: Value,
    ) -> Result<u64, DriverError> {
        let txn = self.db.transaction();
        let Some(stored) = self.get_for_update(
            &txn,
            StoreColumns::Documents,
            &document_key(collection, &filter.id),
        )?
        else {
            return Ok(0);
        };
        let stored = Self::decode_document(&stored)?;
        if !filter.matches(&stored) {
            debug!(collection, id = %filter.id, "conditional replace did not match");
            return Ok(0);
        }
        let document = with_id(document, &filter.id);
        self.stage_document(&txn, collection, &filter.id, Some(&stored), &document)?;
        txn.commit().map_err(Error::into_generic)?;
        Ok(1)
    }

    fn create_index_sync(&self, collection: &str, spec: &IndexSpec) -> Result<String, DriverError> {
        let index = IndexInfo::from(spec);
        let txn = self.db.transaction();
        self.lock_collection(&txn, collection, true)?;
        let entries_cf = self.column_family(StoreColumns::IndexEntries)?;

        // A redefinition starts from an empty set of entries.
        let stale = self.scan_prefix(
            StoreColumns::IndexEntries,
            &index_prefix(collection, &index.name),
        )?;
        for (key, _) in stale {
            txn.delete_cf(entries_cf, key).map_err(Error::into_generic)?;
        }

        let documents = if index.unique {
            self.scan_prefix(StoreColumns::Documents, &collection_prefix(collection))?
        } else {
            Vec::new()
        };
        for (_, value) in documents {
            let document = Self::decode_document(&value)?;
            let id = document_id(collection, &document)?;
            if let Some(entry) = index_entry(&index, &document) {
                self.put_index_entry(&txn, collection, &index, &entry, id)?;
            }
        }

        let serialized = JsonEncoder::encode(&index)
            .map_err(|source| DriverError::JsonEncoderFailed { source })?;
        let indexes_cf = self.column_family(StoreColumns::Indexes)?;
        txn.put_cf(indexes_cf, document_key(collection, &index.name), serialized)
            .map_err(Error::into_generic)?;
        txn.commit().map_err(Error::into_generic)?;
        Ok(index.name)
    }
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    format!("{collection}\0").into_bytes()
}

fn document_key(collection: &str, id: &str) -> Vec<u8> {
    format!("{collection}\0{id}").into_bytes()
}

fn index_prefix(collection: &str, index: &str) -> Vec<u8> {
    format!("{collection}\0{index}\0").into_bytes()
}

fn index_entry_key(collection: &str, index: &IndexInfo, entry: &[Value]) -> Vec<u8> {
    format!(
        "{collection}\0{}\0{}",
        index.name,
        Value::Array(entry.to_vec())
    )
    .into_bytes()
}

#[async_trait]
impl DocumentStore for RocksDBDriver {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, DriverError> {
        let cf = self.column_family(StoreColumns::Documents)?;
        self.db
            .get_cf(cf, document_key(collection, id))
            .map_err(Error::into_generic)?
            .map(|bytes| Self::decode_document(&bytes))
            .transpose()
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        document: Value,
    ) -> Result<InsertOutcome, DriverError> {
        self.insert_sync(collection, document)
    }

    async fn conditional_replace(
        &self,
        collection: &str,
        filter: &ReplaceFilter,
        document: Value,
    ) -> Result<u64, DriverError> {
        self.replace_sync(collection, filter, document)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Value>, DriverError> {
        self.scan_prefix(StoreColumns::Documents, &collection_prefix(collection))?
            .into_iter()
            .map(|(_, value)| Self::decode_document(&value))
            .collect()
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DriverError> {
        let mut indexes = vec![IndexInfo::primary_key()];
        indexes.extend(self.load_indexes(collection)?);
        Ok(indexes)
    }

    async fn create_index(&self, collection: &str, spec: &IndexSpec) -> Result<String, DriverError> {
        self.create_index_sync(collection, spec)
    }
}
