//! The conversation with one peer about one datfile: probe which records
//! it has, then pull assigned ranges until the manager has nothing left
//! for it.

use crate::cache::ThreadCache;
use crate::clock::Clock;
use crate::download::{DownloadManager, StampRange};
use crate::network::Network;
use crate::recent::RecentIndex;
use datsync_common::{Peer, RecordHead, Stamp};
use datsync_metrics::metrics;
use datsync_peer::{PeerRequest, PeerTransport, HAVE_YES};

/// Everything a fetch from a single peer touches.
pub struct RangeFetch<'a, T: PeerTransport> {
    pub net: &'a Network<T>,
    pub recent: &'a RecentIndex,
    pub cache: &'a ThreadCache,
    pub manager: &'a DownloadManager,
    pub clock: &'a dyn Clock,
    /// Probe window in seconds; `0` asks for everything.
    pub get_range: i64,
}

impl<T: PeerTransport> RangeFetch<'_, T> {
    /// Lower stamp bound for a `/head` probe: the window before the newest
    /// recent head of the datfile, or before now if there is none.
    pub async fn probe_begin(&self) -> Stamp {
        if self.get_range == 0 {
            return 0;
        }
        let anchor = match self.recent.newest(self.cache.datfile()).await {
            Some(head) => head.stamp,
            None => self.clock.now(),
        };
        (anchor - self.get_range).max(0)
    }

    /// Ask `peer` which records it holds and feed them to the manager.
    /// Returns whether the peer reported anything.
    pub async fn probe(&self, peer: &Peer) -> bool {
        let datfile = self.cache.datfile();
        let begin = self.probe_begin().await;
        let lines = match self
            .net
            .talk(
                peer,
                &PeerRequest::Head {
                    datfile: datfile.to_string(),
                    begin,
                },
            )
            .await
        {
            Ok(lines) => lines,
            Err(_) => return false,
        };

        if lines.is_empty() {
            self.check_have(peer).await;
            return false;
        }

        self.net.lookup().write().await.remember(datfile, peer);
        let heads: Vec<RecordHead> = lines
            .iter()
            .filter_map(|line| match RecordHead::parse_head_line(line, datfile) {
                Ok(head) => Some(head),
                Err(e) => {
                    tracing::debug!("skipping head line from {}: {}", peer, e);
                    None
                }
            })
            .collect();
        self.manager.set(&heads, peer).await;
        true
    }

    /// A peer with no heads in the window may still hold the datfile.
    /// Forget it only on a definite "no".
    async fn check_have(&self, peer: &Peer) {
        let datfile = self.cache.datfile();
        let request = PeerRequest::Have {
            datfile: datfile.to_string(),
        };
        match self.net.talk(peer, &request).await {
            Ok(lines) if lines.first().map(String::as_str) == Some(HAVE_YES) => {}
            Ok(_) => {
                tracing::debug!("{} does not have {}", peer, datfile);
                self.net.lookup().write().await.forget(datfile, peer);
            }
            Err(_) => {}
        }
    }

    /// Fetch every batch the manager assigns to `peer`. Returns whether at
    /// least one new record was stored.
    pub async fn pull(&self, peer: &Peer) -> bool {
        let datfile = self.cache.datfile();
        let mut stored_any = false;

        while let Some(batch) = self.manager.get(peer).await {
            let range = batch.range;
            let request = PeerRequest::Get {
                datfile: datfile.to_string(),
                from: range.from,
                to: range.to,
            };
            let lines = match self.net.talk(peer, &request).await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(
                        "{}: get {}-{} from {} failed: {}",
                        datfile,
                        range.from,
                        range.to,
                        peer,
                        e
                    );
                    self.manager.finished(&batch, false).await;
                    return stored_any;
                }
            };

            let stored = self.ingest(&lines, range).await;
            self.manager.finished(&batch, true).await;
            tracing::info!("{}: {} record(s) were saved from {}", datfile, stored, peer);
            stored_any |= stored > 0;
        }
        stored_any
    }

    /// Store the valid, new records among `lines` in one transaction, and
    /// index their heads as recent. Returns how many were stored.
    async fn ingest(&self, lines: &[String], range: StampRange) -> usize {
        let result = self
            .cache
            .store()
            .update(|tx| {
                let mut stored = 0usize;
                for line in lines {
                    match self.cache.validate_and_store(tx, line, range) {
                        Ok(Some(head)) => {
                            RecentIndex::append_head(tx, &head)?;
                            stored += 1;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::debug!("{}: rejected record: {}", self.cache.datfile(), e),
                    }
                }
                Ok(stored)
            })
            .await;
        match result {
            Ok(stored) => {
                metrics().records_stored.inc_by(stored as u64);
                stored
            }
            Err(e) => {
                tracing::warn!("{}: failed to store records: {}", self.cache.datfile(), e);
                0
            }
        }
    }
}
