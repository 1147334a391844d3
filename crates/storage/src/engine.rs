//! Storage engine: combines WAL + Memtable behind transactional access.
//!
//! All commits go through the WAL first (for durability), then into
//! the in-memory memtable (for fast reads).

use crate::memtable::Memtable;
use crate::record::{Mutation, WalEntry};
use crate::tx::{ReadTx, WriteTx};
use crate::wal::{FsyncPolicy, Wal, WalError};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// The storage engine. All operations are synchronous (blocking I/O).
/// The async boundary is [`Store`].
#[derive(Debug)]
pub struct StorageEngine {
    pub(crate) memtable: Memtable,
    wal: Wal,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let entries = Wal::replay(&wal_path)?;
        let mut memtable = Memtable::new();
        let transactions = entries.len();
        for entry in entries {
            for mutation in entry.mutations {
                memtable.apply(mutation);
            }
        }

        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            "storage engine opened: {} keys from {} transaction(s) recovered from WAL at {:?}",
            memtable.len(),
            transactions,
            wal_path
        );

        Ok(Self { memtable, wal })
    }

    /// Durably commit a set of mutations as one unit.
    pub fn commit(&mut self, mutations: Vec<Mutation>) -> Result<(), StorageError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let entry = WalEntry::new(mutations);
        self.wal.append(&entry)?;
        for mutation in entry.mutations {
            self.memtable.apply(mutation);
        }
        Ok(())
    }

    /// Number of keys in `namespace`.
    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.memtable.namespace_len(namespace)
    }

    /// Number of keys across all namespaces.
    pub fn key_count(&self) -> usize {
        self.memtable.len()
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

/// Shared handle to a [`StorageEngine`] offering atomic transactions.
///
/// Readers run concurrently; a read-write transaction holds the engine
/// exclusively from its first read until commit.
#[derive(Debug, Clone)]
pub struct Store {
    engine: Arc<RwLock<StorageEngine>>,
}

impl Store {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine: Arc::new(RwLock::new(engine)),
        }
    }

    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        Ok(Self::new(StorageEngine::open(data_dir, fsync)?))
    }

    /// Run `f` against a consistent read view.
    pub async fn view<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&ReadTx<'_>) -> T,
    {
        let engine = self.engine.read().await;
        f(&ReadTx::new(&engine.memtable))
    }

    /// Run `f` inside a read-write transaction. Staged writes are committed
    /// atomically when `f` returns `Ok`, and discarded when it returns `Err`.
    pub async fn update<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut WriteTx<'_>) -> Result<T, StorageError>,
    {
        let mut engine = self.engine.write().await;
        let (value, mutations) = {
            let mut tx = WriteTx::new(&engine.memtable);
            let value = f(&mut tx)?;
            (value, tx.into_mutations())
        };
        engine.commit(mutations)?;
        Ok(value)
    }

    pub async fn key_count(&self) -> usize {
        self.engine.read().await.key_count()
    }

    pub async fn sync(&self) -> Result<(), StorageError> {
        self.engine.write().await.sync()
    }
}
