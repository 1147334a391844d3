//! Storage engine for datsync: WAL + ordered in-memory namespaces.
//!
//! Data lives in named namespaces of `key -> bytes`, scanned in ascending
//! key order. Every read-write transaction is committed as a single WAL
//! entry, so a crash never replays half a transaction.

pub mod engine;
pub mod memtable;
pub mod record;
pub mod tx;
pub mod wal;

pub use engine::{StorageEngine, StorageError, Store};
pub use record::Mutation;
pub use tx::{ReadTx, ReadView, WriteTx};
pub use wal::FsyncPolicy;
