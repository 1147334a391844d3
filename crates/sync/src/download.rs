//! Download bookkeeping for one datfile.
//!
//! A [`DownloadManager`] tracks every record of its datfile that is known
//! either locally or through a peer's `/head` answer:
//!
//! 1. Records already stored locally start finished.
//! 2. [`set`](DownloadManager::set) adds records a peer reports, with that
//!    peer as a candidate source.
//! 3. [`get`](DownloadManager::get) assigns a [`Batch`] of unfinished
//!    records to a peer, carrying the stamp range to fetch.
//! 4. [`finished`](DownloadManager::finished) settles exactly that batch. A
//!    record that fails [`RETRY_CEILING`] times is given up on.
//!
//! Once every record is finished the manager retires itself from the
//! [`ManagerRegistry`](crate::ManagerRegistry).

use crate::registry::ManagerTable;
use datsync_common::{Peer, RecordHead, Stamp};
use datsync_metrics::metrics;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Failed fetch attempts after which a record is given up on.
pub const RETRY_CEILING: u32 = 5;

/// Selections larger than this are halved into a batch.
pub const BATCH_THRESHOLD: usize = 5;

/// Inclusive stamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampRange {
    pub from: Stamp,
    pub to: Stamp,
}

impl StampRange {
    pub fn contains(&self, stamp: Stamp) -> bool {
        self.from <= stamp && stamp <= self.to
    }
}

/// Records handed to one peer by one [`DownloadManager::get`] call.
///
/// Two fetches from the same peer can be in flight at once; the token keeps
/// their settlements apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub peer: Peer,
    pub range: StampRange,
    token: u64,
}

/// Bookkeeping for one record.
#[derive(Debug, Clone)]
struct TargetRecord {
    id: String,
    stamp: Stamp,
    candidates: HashSet<Peer>,
    /// Token of the batch currently fetching this record.
    assigned: Option<u64>,
    finished: bool,
    retries: u32,
}

impl TargetRecord {
    fn stored() -> Self {
        Self {
            id: String::new(),
            stamp: 0,
            candidates: HashSet::new(),
            assigned: None,
            finished: true,
            retries: 0,
        }
    }

    fn reported(head: &RecordHead, peer: &Peer) -> Self {
        Self {
            id: head.id.clone(),
            stamp: head.stamp,
            candidates: HashSet::from([peer.clone()]),
            assigned: None,
            finished: false,
            retries: 0,
        }
    }

    fn eligible_for(&self, peer: &Peer) -> bool {
        !self.finished
            && self.assigned.is_none()
            && self.retries < RETRY_CEILING
            && self.candidates.contains(peer)
    }
}

pub struct DownloadManager {
    datfile: String,
    /// `stamp_id` -> target.
    records: Mutex<HashMap<String, TargetRecord>>,
    next_token: AtomicU64,
    retired: AtomicBool,
    registry: Weak<ManagerTable>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("datfile", &self.datfile)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// A manager not attached to any registry.
    pub fn new(datfile: &str, local_keys: impl IntoIterator<Item = String>) -> Self {
        Self::with_registry(datfile, local_keys, Weak::new())
    }

    pub(crate) fn with_registry(
        datfile: &str,
        local_keys: impl IntoIterator<Item = String>,
        registry: Weak<ManagerTable>,
    ) -> Self {
        let records = local_keys
            .into_iter()
            .map(|key| (key, TargetRecord::stored()))
            .collect();
        Self {
            datfile: datfile.to_string(),
            records: Mutex::new(records),
            next_token: AtomicU64::new(1),
            retired: AtomicBool::new(false),
            registry,
        }
    }

    pub fn datfile(&self) -> &str {
        &self.datfile
    }

    /// Whether the manager has converged and left its registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Record that `peer` holds `heads`. Heads of other datfiles and heads
    /// already finished are ignored.
    pub async fn set(&self, heads: &[RecordHead], peer: &Peer) {
        let mut records = self.records.lock().await;
        let mut added = 0usize;
        for head in heads.iter().filter(|h| h.datfile == self.datfile) {
            match records.get_mut(&head.key()) {
                Some(target) => {
                    if !target.finished {
                        target.candidates.insert(peer.clone());
                    }
                }
                None => {
                    records.insert(head.key(), TargetRecord::reported(head, peer));
                    added += 1;
                }
            }
        }
        tracing::debug!(
            "{}: {} head(s) from {}, {} new",
            self.datfile,
            heads.len(),
            peer,
            added
        );
    }

    /// Assign the next batch to `peer`. Returns `None` when nothing is left
    /// for that peer.
    ///
    /// Eligible records are ordered newest first (ties by id, descending).
    /// More than [`BATCH_THRESHOLD`] eligible records are halved and the
    /// older half is assigned; otherwise all of them are.
    pub async fn get(&self, peer: &Peer) -> Option<Batch> {
        let batch = {
            let mut records = self.records.lock().await;
            let mut eligible: Vec<&mut TargetRecord> = records
                .values_mut()
                .filter(|t| t.eligible_for(peer))
                .collect();
            if eligible.is_empty() {
                None
            } else {
                eligible.sort_by(|a, b| (b.stamp, &b.id).cmp(&(a.stamp, &a.id)));
                let start = if eligible.len() > BATCH_THRESHOLD {
                    eligible.len() / 2
                } else {
                    0
                };
                let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                let picked = &mut eligible[start..];
                for target in picked.iter_mut() {
                    target.assigned = Some(token);
                }
                // Descending order: the last is the oldest.
                let range = StampRange {
                    from: picked[picked.len() - 1].stamp,
                    to: picked[0].stamp,
                };
                tracing::debug!(
                    "{}: assigned {} record(s) {}-{} to {}",
                    self.datfile,
                    picked.len(),
                    range.from,
                    range.to,
                    peer
                );
                Some(Batch {
                    peer: peer.clone(),
                    range,
                    token,
                })
            }
        };

        match batch {
            Some(batch) => {
                metrics().batches_assigned.inc();
                Some(batch)
            }
            None => {
                self.check_completion().await;
                None
            }
        }
    }

    /// Settle `batch`: its records are finished on success, or count one
    /// more failed attempt and become assignable again.
    pub async fn finished(&self, batch: &Batch, success: bool) {
        {
            let mut records = self.records.lock().await;
            let mut settled = 0usize;
            for target in records.values_mut() {
                if target.assigned != Some(batch.token) {
                    continue;
                }
                if success {
                    target.finished = true;
                } else {
                    target.retries += 1;
                }
                target.assigned = None;
                settled += 1;
            }
            if !success && settled > 0 {
                metrics().batches_failed.inc();
                tracing::debug!(
                    "{}: batch of {} record(s) from {} failed",
                    self.datfile,
                    settled,
                    batch.peer
                );
            }
        }
        self.check_completion().await;
    }

    /// Give up on records at the retry ceiling. Returns whether every
    /// record is finished.
    fn settle(&self, records: &mut HashMap<String, TargetRecord>) -> bool {
        let mut given_up = 0u64;
        for target in records.values_mut() {
            if !target.finished && target.retries >= RETRY_CEILING {
                target.finished = true;
                given_up += 1;
            }
        }
        if given_up > 0 {
            metrics().records_given_up.inc_by(given_up);
            tracing::warn!(
                "{}: gave up on {} record(s) after {} failed attempts",
                self.datfile,
                given_up,
                RETRY_CEILING
            );
        }
        records.values().all(|t| t.finished)
    }

    /// Give up on records that hit the retry ceiling, and retire the
    /// manager if nothing is left unfinished. Returns whether the manager
    /// has converged.
    pub async fn check_completion(&self) -> bool {
        if !self.settle(&mut *self.records.lock().await) {
            return false;
        }

        if let Some(registry) = self.registry.upgrade() {
            // Registry before records. Re-check under both, since a caller
            // may have obtained this manager and set new heads meanwhile.
            let mut managers = registry.lock().await;
            if !self.settle(&mut *self.records.lock().await) {
                return false;
            }
            let registered = managers
                .get(&self.datfile)
                .is_some_and(|m| std::ptr::eq(Arc::as_ptr(m), self));
            if registered {
                managers.remove(&self.datfile);
            }
        }
        if !self.retired.swap(true, Ordering::SeqCst) {
            metrics().downloads_completed.inc();
            tracing::info!("{}: finished downloading", self.datfile);
        }
        true
    }

    /// Number of tracked records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Number of records neither stored nor given up on.
    pub async fn unfinished(&self) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|t| !t.finished)
            .count()
    }
    /// `(stamp, retries)` of every reported record, oldest first.
    #[cfg(test)]
    pub(crate) async fn retries_by_stamp(&self) -> Vec<(Stamp, u32)> {
        let mut retries: Vec<(Stamp, u32)> = self
            .records
            .lock()
            .await
            .values()
            .filter(|t| !t.id.is_empty())
            .map(|t| (t.stamp, t.retries))
            .collect();
        retries.sort();
        retries
    }
}
