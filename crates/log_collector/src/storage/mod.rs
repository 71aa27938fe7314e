//! Storage layer
//!
//! All durable state lives in one redb database: raw events, processed-source
//! markers, pipeline checkpoints and the per-pipeline aggregate tables. redb
//! serialises write transactions, so every read-modify-write performed inside
//! one [`WriteTransaction`] is atomic with respect to concurrent writers (the
//! batch cycle and the live event path).

use redb::{
    Database, Key, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::sync::Arc;

use crate::{
    config::StorageConfig,
    error::{CollectorError, CollectorResult},
    pipeline::PipelineKind,
};

pub mod checkpoint;
pub mod repository;

pub use checkpoint::CheckpointStore;
pub use repository::{EventRepository, IngestStats};

/// Raw events keyed by (log time micros, type hash, user name)
pub(crate) const RAW_EVENTS: TableDefinition<(i64, &str, &str), &[u8]> =
    TableDefinition::new("raw_events");
/// Processed source units keyed by name
pub(crate) const PROCESSED_SOURCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("processed_sources");
/// Pipeline checkpoints (log time micros) keyed by pipeline id
pub(crate) const CHECKPOINTS: TableDefinition<&str, i64> = TableDefinition::new("checkpoints");

/// Map a redb error into a database error for the given operation
pub(crate) fn db_err<E: Display>(operation: &'static str) -> impl FnOnce(E) -> CollectorError {
    move |e| CollectorError::database(operation, e.to_string())
}

/// Handle to the collector database
#[derive(Debug, Clone)]
pub struct Store {
    database: Arc<Database>,
}

impl Store {
    /// Open (or create) the database described by the storage configuration
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or its tables created
    pub fn open(config: &StorageConfig) -> CollectorResult<Self> {
        let cache_size = usize::try_from(config.cache_size_bytes).unwrap_or(128 * 1024 * 1024);

        let database = if config.use_memory_storage {
            Database::builder()
                .set_cache_size(cache_size)
                .create_with_backend(redb::backends::InMemoryBackend::new())
                .map_err(|e| {
                    CollectorError::database(
                        "database_open",
                        format!("Failed to create in-memory database: {e}"),
                    )
                })?
        } else if let Some(ref path) = config.database_path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CollectorError::database(
                        "create_directory",
                        format!("Failed to create directory {}: {}", parent.display(), e),
                    )
                })?;
            }

            Database::builder()
                .set_cache_size(cache_size)
                .create(path)
                .map_err(|e| {
                    CollectorError::database(
                        "database_open",
                        format!("Failed to open database {}: {}", path.display(), e),
                    )
                })?
        } else {
            return Err(CollectorError::configuration(
                "Either use_memory_storage must be true or database_path must be provided",
            ));
        };

        let store = Self {
            database: Arc::new(database),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Open an empty in-memory database
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created
    pub fn in_memory() -> CollectorResult<Self> {
        Self::open(&StorageConfig {
            use_memory_storage: true,
            database_path: None,
            ..StorageConfig::default()
        })
    }

    fn init_tables(&self) -> CollectorResult<()> {
        self.write("init_tables", |txn| {
            txn.open_table(RAW_EVENTS).map_err(db_err("open_raw_events"))?;
            txn.open_table(PROCESSED_SOURCES)
                .map_err(db_err("open_processed_sources"))?;
            txn.open_table(CHECKPOINTS)
                .map_err(db_err("open_checkpoints"))?;

            for kind in PipelineKind::ALL {
                kind.create_tables(txn)?;
            }
            Ok(())
        })
    }

    /// Begin a read transaction
    ///
    /// # Errors
    ///
    /// Returns error if the transaction cannot be started
    pub fn begin_read(&self) -> CollectorResult<ReadTransaction> {
        self.database.begin_read().map_err(db_err("begin_read"))
    }

    /// Begin a write transaction
    ///
    /// Write transactions are exclusive; a second writer blocks until the
    /// first commits or aborts.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction cannot be started
    pub fn begin_write(&self) -> CollectorResult<WriteTransaction> {
        self.database.begin_write().map_err(db_err("begin_write"))
    }

    /// Run `op` inside one write transaction and commit it
    ///
    /// Nothing is committed if `op` fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `op`, or a database error if the commit fails
    pub fn write<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&WriteTransaction) -> CollectorResult<T>,
    ) -> CollectorResult<T> {
        let txn = self.begin_write()?;
        let result = op(&txn)?;
        txn.commit().map_err(db_err(operation))?;
        Ok(result)
    }

    /// Perform health check
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoints table cannot be read
    pub fn health_check(&self) -> CollectorResult<()> {
        let txn = self.begin_read()?;
        let _table = txn
            .open_table(CHECKPOINTS)
            .map_err(db_err("health_check_table"))?;
        Ok(())
    }
}

/// Read and decode a JSON value inside a write transaction
pub(crate) fn get_json<'k, K, T>(
    txn: &WriteTransaction,
    definition: TableDefinition<'_, K, &'static [u8]>,
    key: K::SelfType<'k>,
) -> CollectorResult<Option<T>>
where
    K: Key + 'static,
    T: DeserializeOwned,
{
    let table = txn.open_table(definition).map_err(db_err("open_table"))?;
    let guard = table.get(key).map_err(db_err("get"))?;
    let decoded = match guard {
        Some(value) => Some(serde_json::from_slice(value.value())?),
        None => None,
    };
    Ok(decoded)
}

/// Encode and write a JSON value inside a write transaction
pub(crate) fn put_json<'k, K, T>(
    txn: &WriteTransaction,
    definition: TableDefinition<'_, K, &'static [u8]>,
    key: K::SelfType<'k>,
    value: &T,
) -> CollectorResult<()>
where
    K: Key + 'static,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    let mut table = txn.open_table(definition).map_err(db_err("open_table"))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(db_err("insert"))?;
    Ok(())
}

/// Read and decode a JSON value in its own read transaction
pub(crate) fn fetch_json<'k, K, T>(
    store: &Store,
    definition: TableDefinition<'_, K, &'static [u8]>,
    key: K::SelfType<'k>,
) -> CollectorResult<Option<T>>
where
    K: Key + 'static,
    T: DeserializeOwned,
{
    let txn = store.begin_read()?;
    let table = txn.open_table(definition).map_err(db_err("open_table"))?;
    let guard = table.get(key).map_err(db_err("get"))?;
    let decoded = match guard {
        Some(value) => Some(serde_json::from_slice(value.value())?),
        None => None,
    };
    Ok(decoded)
}

/// Decode every JSON value of a table within `range`, in key order
pub(crate) fn scan_json<'k, K, T, R>(
    txn: &ReadTransaction,
    definition: TableDefinition<'_, K, &'static [u8]>,
    range: R,
) -> CollectorResult<Vec<T>>
where
    K: Key + 'static,
    T: DeserializeOwned,
    R: std::ops::RangeBounds<K::SelfType<'k>> + 'k,
{
    let table = txn.open_table(definition).map_err(db_err("open_table"))?;
    let mut rows = Vec::new();
    for entry in table.range(range).map_err(db_err("range"))? {
        let (_, value) = entry.map_err(db_err("range_next"))?;
        rows.push(serde_json::from_slice(value.value())?);
    }
    Ok(rows)
}
