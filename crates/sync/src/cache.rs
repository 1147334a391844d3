//! Local storage of one thread's records.
//!
//! Records live in the `record` namespace under `datfile:stamp_id` keys
//! (zero-padded stamp), so a prefix scan yields a thread in chronological
//! order. Threads the node follows are listed in the `cache` namespace.

use crate::download::StampRange;
use datsync_common::{datfile_prefix, validate_datfile, Record, RecordError, RecordHead, Stamp};
use datsync_storage::{ReadView, StorageError, Store, WriteTx};
use std::collections::HashSet;

pub const RECORD_NS: &str = "record";
pub const CACHE_NS: &str = "cache";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Handle on one datfile's records in the local store.
#[derive(Debug, Clone)]
pub struct ThreadCache {
    datfile: String,
    store: Store,
}

impl ThreadCache {
    pub fn new(datfile: &str, store: Store) -> Result<Self, RecordError> {
        validate_datfile(datfile)?;
        Ok(Self {
            datfile: datfile.to_string(),
            store,
        })
    }

    /// Every thread the node has subscribed to.
    pub async fn all(store: &Store) -> Vec<ThreadCache> {
        let datfiles: Vec<String> = store
            .view(|tx| {
                tx.scan_prefix(CACHE_NS, "")
                    .into_iter()
                    .map(|(datfile, _)| datfile)
                    .collect()
            })
            .await;
        datfiles
            .into_iter()
            .filter_map(|datfile| ThreadCache::new(&datfile, store.clone()).ok())
            .collect()
    }

    pub fn datfile(&self) -> &str {
        &self.datfile
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Follow this thread, so periodic syncs keep it up to date.
    pub async fn subscribe(&self, now: Stamp) -> Result<(), StorageError> {
        self.store
            .update(|tx| {
                if !tx.exists(CACHE_NS, &self.datfile) {
                    tx.put_json(CACHE_NS, &self.datfile, &now)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn is_subscribed(&self) -> bool {
        self.store
            .view(|tx| tx.exists(CACHE_NS, &self.datfile))
            .await
    }

    /// `stamp_id` keys of every stored record.
    pub async fn record_keys(&self) -> HashSet<String> {
        self.heads_since(0)
            .await
            .iter()
            .map(RecordHead::key)
            .collect()
    }

    pub async fn has_record(&self) -> bool {
        let prefix = datfile_prefix(&self.datfile);
        self.store
            .view(|tx| !tx.scan_prefix(RECORD_NS, &prefix).is_empty())
            .await
    }

    /// Stamp of the newest stored record.
    pub async fn newest_stamp(&self) -> Option<Stamp> {
        self.heads_since(0).await.last().map(|h| h.stamp)
    }

    /// Heads with `stamp >= begin`, oldest first.
    pub async fn heads_since(&self, begin: Stamp) -> Vec<RecordHead> {
        self.scan()
            .await
            .into_iter()
            .map(|r| r.head)
            .filter(|h| h.stamp >= begin)
            .collect()
    }

    /// Records with `from <= stamp <= to`, oldest first.
    pub async fn records_in(&self, from: Stamp, to: Stamp) -> Vec<Record> {
        let range = StampRange { from, to };
        self.scan()
            .await
            .into_iter()
            .filter(|r| range.contains(r.head.stamp))
            .collect()
    }

    /// Store a record produced locally.
    pub async fn put_record(&self, record: &Record) -> Result<bool, IngestError> {
        if record.head.datfile != self.datfile {
            return Err(RecordError::InvalidDatfile(record.head.datfile.clone()).into());
        }
        self.store
            .update(|tx| Ok(Self::put_record_tx(tx, record)?))
            .await
            .map_err(IngestError::from)
    }

    /// Parse a `/get` line, check it belongs to `range`, and store it.
    ///
    /// Returns the head when the record was new, `None` if it was already
    /// stored.
    pub fn validate_and_store(
        &self,
        tx: &mut WriteTx<'_>,
        line: &str,
        range: StampRange,
    ) -> Result<Option<RecordHead>, IngestError> {
        let record = Record::parse(line, &self.datfile)?;
        if !range.contains(record.head.stamp) {
            return Err(RecordError::OutOfRange {
                stamp: record.head.stamp,
                from: range.from,
                to: range.to,
            }
            .into());
        }
        if Self::put_record_tx(tx, &record)? {
            Ok(Some(record.head))
        } else {
            Ok(None)
        }
    }

    fn put_record_tx(tx: &mut WriteTx<'_>, record: &Record) -> Result<bool, StorageError> {
        let key = record.head.index_key();
        if tx.exists(RECORD_NS, &key) {
            return Ok(false);
        }
        tx.put_json(RECORD_NS, &key, record)?;
        Ok(true)
    }

    async fn scan(&self) -> Vec<Record> {
        let prefix = datfile_prefix(&self.datfile);
        self.store
            .view(|tx| tx.scan_json::<Record>(RECORD_NS, &prefix))
            .await
            .into_iter()
            .map(|(_, record)| record)
            .collect()
    }
}
