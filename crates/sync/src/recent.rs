//! The recent index: which datfiles saw activity lately, and their heads.
//!
//! Heads live in the `recent` namespace under `datfile:stamp_id` keys with
//! a zero-padded stamp, so a datfile prefix scan runs oldest to newest.
//! Every read-then-write sequence runs inside one store transaction.

use crate::clock::Clock;
use crate::network::Network;
use crate::suggest::TagSuggester;
use crate::SyncSettings;
use datsync_common::{datfile_prefix, Peer, RecentLine, RecordHead, Stamp};
use datsync_metrics::metrics;
use datsync_peer::{PeerRequest, PeerTransport};
use datsync_storage::{ReadView, StorageError, Store, WriteTx};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const RECENT_NS: &str = "recent";

pub struct RecentIndex {
    store: Store,
    clock: Arc<dyn Clock>,
    suggester: Arc<dyn TagSuggester>,
    settings: SyncSettings,
}

impl std::fmt::Debug for RecentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecentIndex")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RecentIndex {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        suggester: Arc<dyn TagSuggester>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            clock,
            suggester,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -----------------------------------------------------------------------
    // Append / lookup
    // -----------------------------------------------------------------------

    /// Insert `head` inside `tx` unless it is already indexed. Returns
    /// whether it was new.
    pub fn append_head(tx: &mut WriteTx<'_>, head: &RecordHead) -> Result<bool, StorageError> {
        let key = head.index_key();
        if tx.exists(RECENT_NS, &key) {
            return Ok(false);
        }
        tx.put_json(RECENT_NS, &key, head)?;
        Ok(true)
    }

    /// Insert `head` unless it is already indexed.
    pub async fn append(&self, head: &RecordHead) -> Result<bool, StorageError> {
        self.store
            .update(|tx| Self::append_head(tx, head))
            .await
    }

    /// The newest head of `datfile`.
    pub async fn newest(&self, datfile: &str) -> Option<RecordHead> {
        let prefix = datfile_prefix(datfile);
        self.store
            .view(|tx| tx.scan_json::<RecordHead>(RECENT_NS, &prefix))
            .await
            .pop()
            .map(|(_, head)| head)
    }

    /// Every indexed head, grouped by datfile, oldest first within each.
    pub async fn heads(&self) -> Vec<RecordHead> {
        self.store
            .view(|tx| tx.scan_json::<RecordHead>(RECENT_NS, ""))
            .await
            .into_iter()
            .map(|(_, head)| head)
            .collect()
    }

    /// Heads stamped at or after `begin`.
    pub async fn heads_since(&self, begin: Stamp) -> Vec<RecordHead> {
        let mut heads = self.heads().await;
        heads.retain(|h| h.stamp >= begin);
        heads
    }

    /// Distinct datfiles in the index, sorted.
    pub async fn datfiles(&self) -> Vec<String> {
        self.heads()
            .await
            .into_iter()
            .map(|h| h.datfile)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether `stamp` lies within the update window around now.
    pub fn is_in_update_range(&self, stamp: Stamp) -> bool {
        let now = self.clock.now();
        let window = self.settings.update_range;
        now - window < stamp && stamp < now + window
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Drop heads that fell out of the retention window. Does nothing when
    /// retention is disabled.
    pub async fn remove_olds(&self) -> Result<usize, StorageError> {
        if self.settings.recent_range <= 0 {
            return Ok(0);
        }
        self.remove_until(self.clock.now() - self.settings.recent_range)
            .await
    }

    /// Delete every head with `stamp <= cutoff`, across all datfiles.
    pub async fn remove_until(&self, cutoff: Stamp) -> Result<usize, StorageError> {
        let removed = self
            .store
            .update(|tx| {
                let old: Vec<String> = tx
                    .scan_json::<RecordHead>(RECENT_NS, "")
                    .into_iter()
                    .filter(|(_, head)| head.stamp <= cutoff)
                    .map(|(key, _)| key)
                    .collect();
                for key in &old {
                    tx.delete(RECENT_NS, key);
                }
                Ok(old.len())
            })
            .await?;
        if removed > 0 {
            tracing::info!("removed {} old recent record(s)", removed);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Poll a random sample of peers for heads since the update window
    /// (since the beginning when `all`). Returns how many new heads were
    /// added.
    pub async fn refresh<T: PeerTransport>(&self, net: &Network<T>, all: bool) -> usize {
        let begin = if all {
            0
        } else {
            (self.clock.now() - self.settings.update_range).max(0)
        };
        let peers = net
            .lookup()
            .read()
            .await
            .random_peers(self.settings.search_depth);

        let added: usize = futures::future::join_all(
            peers.iter().map(|peer| self.refresh_from(net, peer, begin)),
        )
        .await
        .into_iter()
        .sum();

        let heads = self.heads().await;
        match self
            .store
            .update(|tx| self.suggester.prune(tx, &heads))
            .await
        {
            Ok(pruned) if pruned > 0 => {
                tracing::debug!("pruned tag suggestions of {} datfile(s)", pruned)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to prune tag suggestions: {}", e),
        }
        added
    }

    async fn refresh_from<T: PeerTransport>(&self, net: &Network<T>, peer: &Peer, begin: Stamp) -> usize {
        let lines = match net.talk(peer, &PeerRequest::Recent { begin }).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("recent from {} failed: {}", peer, e);
                net.lookup().write().await.forget_everywhere(peer);
                return 0;
            }
        };

        let result = self
            .store
            .update(|tx| {
                let mut added = 0usize;
                let mut datfiles = BTreeSet::new();
                for line in &lines {
                    let recent = match RecentLine::parse(line) {
                        Ok(recent) => recent,
                        Err(e) => {
                            tracing::debug!("skipping recent line from {}: {}", peer, e);
                            continue;
                        }
                    };
                    if Self::append_head(tx, &recent.head)? {
                        added += 1;
                    }
                    self.suggester
                        .add_tags(tx, &recent.head.datfile, &recent.tags)?;
                    datfiles.insert(recent.head.datfile);
                }
                Ok((added, datfiles))
            })
            .await;

        match result {
            Ok((added, datfiles)) => {
                let mut lookup = net.lookup().write().await;
                for datfile in &datfiles {
                    lookup.remember(datfile, peer);
                }
                drop(lookup);
                metrics().recent_heads_appended.inc_by(added as u64);
                tracing::info!(
                    "added {} recent record(s) from {} ({} line(s))",
                    added,
                    peer,
                    lines.len()
                );
                added
            }
            Err(e) => {
                tracing::warn!("failed to store recent records from {}: {}", peer, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::suggest::SuggestedTags;
    use crate::testutil::{head, id, open_store, peer, record, FakeNetwork, FakePeer};
    use datsync_peer::LookupTable;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    const NOW: Stamp = 1_700_000_000;

    fn index(clock: Arc<ManualClock>) -> (TempDir, RecentIndex) {
        let (dir, store) = open_store();
        let index = RecentIndex::new(
            store,
            clock,
            Arc::new(SuggestedTags::new(20)),
            SyncSettings::default(),
        );
        (dir, index)
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let (_dir, recent) = index(Arc::new(ManualClock::new(NOW)));
        let h = head("thread_a", 10, 1);
        assert!(recent.append(&h).await.unwrap());
        assert!(!recent.append(&h).await.unwrap());
        assert_eq!(recent.heads().await, vec![h]);
    }

    #[tokio::test]
    async fn test_newest() {
        let (_dir, recent) = index(Arc::new(ManualClock::new(NOW)));
        for (stamp, n) in [(10, 1), (30, 2), (20, 3)] {
            recent.append(&head("thread_a", stamp, n)).await.unwrap();
        }
        recent.append(&head("thread_b", 99, 4)).await.unwrap();

        assert_eq!(recent.newest("thread_a").await, Some(head("thread_a", 30, 2)));
        assert_eq!(recent.newest("thread_c").await, None);
        // "thread_a" must not match "thread_ab".
        recent.append(&head("thread_ab", 500, 5)).await.unwrap();
        assert_eq!(recent.newest("thread_a").await.unwrap().stamp, 30);
    }

    #[tokio::test]
    async fn test_retention() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (_dir, mut recent) = index(clock.clone());
        recent.settings.recent_range = 50;

        recent.append(&head("thread_a", NOW - 100, 1)).await.unwrap();
        recent.append(&head("thread_b", NOW - 10, 2)).await.unwrap();

        assert_eq!(recent.remove_olds().await.unwrap(), 1);
        assert_eq!(recent.heads().await, vec![head("thread_b", NOW - 10, 2)]);
    }

    #[tokio::test]
    async fn test_retention_disabled() {
        let (_dir, mut recent) = index(Arc::new(ManualClock::new(NOW)));
        recent.settings.recent_range = 0;
        recent.append(&head("thread_a", 1, 1)).await.unwrap();
        assert_eq!(recent.remove_olds().await.unwrap(), 0);
        assert_eq!(recent.heads().await.len(), 1);
    }

    #[tokio::test]
    async fn test_datfiles_and_heads_since() {
        let (_dir, recent) = index(Arc::new(ManualClock::new(NOW)));
        recent.append(&head("thread_b", 5, 1)).await.unwrap();
        recent.append(&head("thread_a", 50, 2)).await.unwrap();
        recent.append(&head("thread_b", 70, 3)).await.unwrap();

        assert_eq!(recent.datfiles().await, vec!["thread_a", "thread_b"]);
        assert_eq!(recent.heads_since(50).await.len(), 2);
    }

    #[test]
    fn test_update_range() {
        let (_dir, recent) = index(Arc::new(ManualClock::new(NOW)));
        let day = 24 * 60 * 60;
        assert!(recent.is_in_update_range(NOW));
        assert!(recent.is_in_update_range(NOW - day + 1));
        assert!(!recent.is_in_update_range(NOW - day));
        assert!(!recent.is_in_update_range(NOW + day));
    }

    #[tokio::test]
    async fn test_refresh_collects_heads_tags_and_affinity() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (_dir, recent) = index(clock);

        let fake = Arc::new(FakeNetwork::default());
        let mut tagged = record("thread_a", NOW - 10, 1);
        tagged.body.push(("tag".into(), "rust p2p".into()));
        fake.add_peer(
            peer(1),
            FakePeer {
                records: vec![tagged, record("thread_b", NOW - 20, 2)],
                recent: vec!["garbage".into()],
                ..FakePeer::default()
            },
        );
        fake.add_peer(
            peer(2),
            FakePeer {
                records: vec![record("thread_a", NOW - 10, 1)],
                ..FakePeer::default()
            },
        );
        fake.set_down(&peer(3));

        let lookup = Arc::new(RwLock::new(LookupTable::with_nodes([
            peer(1),
            peer(2),
            peer(3),
        ])));
        lookup.write().await.remember("thread_c", &peer(3));
        let net = Network::new(fake.clone(), lookup.clone());

        let added = recent.refresh(&net, true).await;
        assert_eq!(added, 2);
        assert_eq!(recent.datfiles().await, vec!["thread_a", "thread_b"]);

        let tags = recent
            .store()
            .view(|tx| SuggestedTags::get(tx, "thread_a"))
            .await;
        assert_eq!(tags, vec!["rust", "p2p"]);

        let lt = lookup.read().await;
        let mut a = lt.known_for("thread_a");
        a.sort();
        assert_eq!(a, vec![peer(1), peer(2)]);
        assert_eq!(lt.known_for("thread_b"), vec![peer(1)]);
        // The unreachable peer lost its affinity but stays known.
        assert!(lt.known_for("thread_c").is_empty());
        assert!(lt.nodes().contains(&peer(3)));

        let asked: Vec<PeerRequest> = fake.calls().into_iter().map(|(_, r)| r).collect();
        assert!(asked.iter().all(|r| *r == PeerRequest::Recent { begin: 0 }));
    }

    #[tokio::test]
    async fn test_refresh_window_and_prune() {
        let clock = Arc::new(ManualClock::new(NOW));
        let (_dir, recent) = index(clock);

        recent
            .store()
            .update(|tx| {
                SuggestedTags::new(20).add_tags(tx, "thread_gone", &["old".to_string()])
            })
            .await
            .unwrap();

        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                recent: vec![format!("{}<>{}<>thread_a<>tag:new", NOW - 5, id(7))],
                ..FakePeer::default()
            },
        );
        let lookup = Arc::new(RwLock::new(LookupTable::with_nodes([peer(1)])));
        let net = Network::new(fake.clone(), lookup);

        assert_eq!(recent.refresh(&net, false).await, 1);
        assert_eq!(
            fake.calls()[0].1,
            PeerRequest::Recent {
                begin: NOW - 24 * 60 * 60
            }
        );

        let (gone, kept) = recent
            .store()
            .view(|tx| {
                (
                    SuggestedTags::get(tx, "thread_gone"),
                    SuggestedTags::get(tx, "thread_a"),
                )
            })
            .await;
        assert!(gone.is_empty());
        assert_eq!(kept, vec!["new"]);
    }

    #[tokio::test]
    async fn test_refresh_without_peers() {
        let (_dir, recent) = index(Arc::new(ManualClock::new(NOW)));
        let net = Network::new(
            Arc::new(FakeNetwork::default()),
            Arc::new(RwLock::new(LookupTable::new())),
        );
        assert_eq!(recent.refresh(&net, false).await, 0);
    }
}
