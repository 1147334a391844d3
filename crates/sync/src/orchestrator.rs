//! Sync orchestration: fan a datfile download out over many peers.
//!
//! Every sampled peer gets its own detached task running
//! [`RangeFetch::probe`] then [`RangeFetch::pull`], all sharing the
//! datfile's [`DownloadManager`]. A foreground sync waits for all of them.
//! A background sync returns early (see [`BackoffWait`]) and leaves the
//! tasks running; their results land in the store later.

use crate::cache::ThreadCache;
use crate::clock::Clock;
use crate::fetch::RangeFetch;
use crate::network::Network;
use crate::recent::RecentIndex;
use crate::registry::ManagerRegistry;
use crate::SyncSettings;
use datsync_peer::PeerTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Escalating waits of a background sync: 2s, 3s, 4s.
#[derive(Debug, Clone)]
pub struct BackoffWait {
    next: Duration,
    step: Duration,
    cap: Duration,
}

impl BackoffWait {
    pub fn new(first: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            next: first,
            step,
            cap,
        }
    }
}

impl Default for BackoffWait {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }
}

impl Iterator for BackoffWait {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.next >= self.cap {
            return None;
        }
        let delay = self.next;
        self.next += self.step;
        Some(delay)
    }
}

pub struct Syncer<T: PeerTransport> {
    net: Network<T>,
    recent: Arc<RecentIndex>,
    registry: ManagerRegistry,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl<T: PeerTransport> Clone for Syncer<T> {
    fn clone(&self) -> Self {
        Self {
            net: self.net.clone(),
            recent: self.recent.clone(),
            registry: self.registry.clone(),
            clock: self.clock.clone(),
            settings: self.settings,
        }
    }
}

impl<T: PeerTransport> std::fmt::Debug for Syncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<T: PeerTransport> Syncer<T> {
    pub fn new(
        net: Network<T>,
        recent: Arc<RecentIndex>,
        registry: ManagerRegistry,
        settings: SyncSettings,
    ) -> Self {
        let clock = recent.clock().clone();
        Self {
            net,
            recent,
            registry,
            clock,
            settings,
        }
    }

    pub fn net(&self) -> &Network<T> {
        &self.net
    }

    pub fn recent(&self) -> &Arc<RecentIndex> {
        &self.recent
    }

    pub fn registry(&self) -> &ManagerRegistry {
        &self.registry
    }

    /// Refresh the recent index from the network.
    pub async fn refresh(&self, all: bool) -> usize {
        self.recent.refresh(&self.net, all).await
    }

    /// Download `cache`'s datfile from up to `search_depth` peers. Returns
    /// whether any new record was stored by the time the call returns.
    ///
    /// With `background`, returns once all peers are done, the thread has a
    /// record, or the [`BackoffWait`] runs out, whichever comes first;
    /// fetches still running keep going after that.
    pub async fn sync(&self, cache: &ThreadCache, background: bool) -> bool {
        let datfile = cache.datfile().to_string();
        let peers = self
            .net
            .lookup()
            .read()
            .await
            .candidates_for(&datfile, self.settings.search_depth);
        let up_to_date = background && self.is_up_to_date(cache).await;

        let manager = self
            .registry
            .obtain(&datfile, cache.record_keys().await)
            .await;
        tracing::debug!("{}: syncing from {} peer(s)", datfile, peers.len());

        let found = Arc::new(AtomicBool::new(false));
        let tasks: Vec<JoinHandle<()>> = peers
            .into_iter()
            .map(|peer| {
                let net = self.net.clone();
                let recent = self.recent.clone();
                let clock = self.clock.clone();
                let cache = cache.clone();
                let manager = manager.clone();
                let found = found.clone();
                let get_range = self.settings.get_range;
                tokio::spawn(async move {
                    let fetch = RangeFetch {
                        net: &net,
                        recent: &recent,
                        cache: &cache,
                        manager: &manager,
                        clock: clock.as_ref(),
                        get_range,
                    };
                    if fetch.probe(&peer).await && fetch.pull(&peer).await {
                        found.store(true, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // A manager nobody had anything for still has to leave the registry.
        let mut all_done = tokio::spawn(async move {
            futures::future::join_all(tasks).await;
            manager.check_completion().await;
        });

        if !background {
            if let Err(e) = all_done.await {
                tracing::warn!("{}: sync task failed: {}", datfile, e);
            }
        } else if !up_to_date {
            for delay in BackoffWait::default() {
                tokio::select! {
                    _ = &mut all_done => break,
                    _ = tokio::time::sleep(delay) => {
                        if cache.has_record().await {
                            break;
                        }
                    }
                }
            }
        }
        found.load(Ordering::SeqCst)
    }

    /// Whether the newest local record is the newest one the recent index
    /// knows about.
    async fn is_up_to_date(&self, cache: &ThreadCache) -> bool {
        match self.recent.newest(cache.datfile()).await {
            Some(head) => cache.newest_stamp().await == Some(head.stamp),
            None => false,
        }
    }

    /// Subscribe to `datfiles`. Returns how many were newly subscribed;
    /// invalid names are skipped.
    pub async fn follow<'d>(&self, datfiles: impl IntoIterator<Item = &'d str>) -> usize {
        let now = self.clock.now();
        let mut added = 0;
        for datfile in datfiles {
            let cache = match ThreadCache::new(datfile, self.recent.store().clone()) {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::warn!("not following {}: {}", datfile, e);
                    continue;
                }
            };
            if cache.is_subscribed().await {
                continue;
            }
            match cache.subscribe(now).await {
                Ok(()) => {
                    tracing::info!("following {}", datfile);
                    added += 1;
                }
                Err(e) => tracing::warn!("failed to subscribe to {}: {}", datfile, e),
            }
        }
        added
    }

    /// Subscribe to every datfile the recent index knows about.
    pub async fn follow_recent(&self) -> usize {
        let datfiles = self.recent.datfiles().await;
        self.follow(datfiles.iter().map(String::as_str)).await
    }

    /// Sync every subscribed thread in the foreground, one after another.
    /// Returns how many threads received new records.
    pub async fn sync_all(&self) -> usize {
        let mut updated = 0;
        for cache in ThreadCache::all(self.recent.store()).await {
            tracing::info!("{} is downloading...", cache.datfile());
            if self.sync(&cache, false).await {
                updated += 1;
            }
            tracing::info!("{} end", cache.datfile());
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::suggest::SuggestedTags;
    use crate::testutil::{open_store, peer, record, FakeNetwork, FakePeer};
    use datsync_common::{Record, Stamp};
    use datsync_peer::chaos::{ChaosConfig, ChaosTransport};
    use datsync_peer::LookupTable;
    use datsync_storage::Store;
    use tokio::sync::RwLock;

    const NOW: Stamp = 1_700_000_000;

    fn syncer<T: PeerTransport>(transport: Arc<T>, store: Store, peers: &[u16]) -> Syncer<T> {
        let lookup = Arc::new(RwLock::new(LookupTable::with_nodes(
            peers.iter().map(|p| peer(*p)),
        )));
        let settings = SyncSettings {
            get_range: 0,
            ..SyncSettings::default()
        };
        let recent = Arc::new(RecentIndex::new(
            store,
            Arc::new(ManualClock::new(NOW)),
            Arc::new(SuggestedTags::new(20)),
            settings,
        ));
        Syncer::new(
            Network::new(transport, lookup),
            recent,
            ManagerRegistry::new(),
            settings,
        )
    }

    fn thread(store: &Store) -> ThreadCache {
        ThreadCache::new("thread_a", store.clone()).unwrap()
    }

    fn records(stamps: &[Stamp]) -> Vec<Record> {
        stamps
            .iter()
            .map(|s| record("thread_a", *s, *s as u32))
            .collect()
    }

    async fn stamps(cache: &ThreadCache) -> Vec<Stamp> {
        cache.heads_since(0).await.iter().map(|h| h.stamp).collect()
    }

    #[test]
    fn test_backoff_sequence() {
        let waits: Vec<u64> = BackoffWait::default().map(|d| d.as_secs()).collect();
        assert_eq!(waits, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_foreground_sync_from_several_peers() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        cache.put_record(&record("thread_a", 100, 100)).await.unwrap();

        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: records(&[100, 150, 200]),
                ..FakePeer::default()
            },
        );
        fake.add_peer(
            peer(2),
            FakePeer {
                records: records(&[200, 250, 300, 350, 400, 450, 500]),
                ..FakePeer::default()
            },
        );
        fake.add_peer(peer(3), FakePeer::default());
        let syncer = syncer(fake.clone(), store, &[1, 2, 3]);

        assert!(syncer.sync(&cache, false).await);
        assert_eq!(
            stamps(&cache).await,
            vec![100, 150, 200, 250, 300, 350, 400, 450, 500]
        );
        assert!(syncer.registry().is_empty().await);

        // Peer 3 had nothing and said so.
        let lt = syncer.net().lookup().read().await;
        assert!(!lt.known_for("thread_a").contains(&peer(3)));
        assert!(lt.known_for("thread_a").contains(&peer(1)));
    }

    #[tokio::test]
    async fn test_sync_with_nothing_found() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(peer(1), FakePeer::default());
        let syncer = syncer(fake, store, &[1]);

        assert!(!syncer.sync(&cache, false).await);
        assert!(!syncer.registry().is_active("thread_a").await);
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_stop_others() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = FakeNetwork::default();
        for p in [1, 2] {
            fake.add_peer(
                peer(p),
                FakePeer {
                    records: records(&[10, 20, 30]),
                    ..FakePeer::default()
                },
            );
        }
        let chaos = Arc::new(ChaosTransport::new(fake, ChaosConfig::default()));
        chaos.fail_peer(peer(1)).await;
        let syncer = syncer(chaos.clone(), store, &[1, 2]);

        assert!(syncer.sync(&cache, false).await);
        assert_eq!(stamps(&cache).await, vec![10, 20, 30]);
        assert!(chaos.injected_failures() >= 1);
    }

    #[tokio::test]
    async fn test_concurrent_syncs_share_one_download() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: records(&[10, 20, 30]),
                ..FakePeer::default()
            },
        );
        let syncer = syncer(fake.clone(), store, &[1]);

        let (a, b) = tokio::join!(syncer.sync(&cache, false), syncer.sync(&cache, false));
        assert!(a || b);
        assert_eq!(stamps(&cache).await, vec![10, 20, 30]);
        assert_eq!(fake.count("get"), 1);
        assert!(syncer.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_returns_after_backoff() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: records(&[10, 20]),
                ..FakePeer::default()
            },
        );
        fake.set_delay(&peer(1), Duration::from_secs(30));
        let syncer = syncer(fake.clone(), store, &[1]);

        let start = tokio::time::Instant::now();
        assert!(!syncer.sync(&cache, true).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(9), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(10), "waited {:?}", waited);
        assert!(!cache.has_record().await);

        // The detached fetch finishes on its own.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(stamps(&cache).await, vec![10, 20]);
        assert!(syncer.registry().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_returns_once_a_record_arrives() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: records(&[10]),
                ..FakePeer::default()
            },
        );
        fake.add_peer(peer(2), FakePeer::default());
        fake.set_delay(&peer(2), Duration::from_secs(100));
        let syncer = syncer(fake.clone(), store, &[1, 2]);

        let start = tokio::time::Instant::now();
        assert!(syncer.sync(&cache, true).await);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        // Peer 2 is still answering its probe.
        assert_eq!(fake.count("have"), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fake.count("have"), 1);
        assert!(!syncer.registry().is_active("thread_a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_returns_when_all_peers_done() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: records(&[10]),
                ..FakePeer::default()
            },
        );
        fake.set_delay(&peer(1), Duration::from_millis(400));
        let syncer = syncer(fake, store, &[1]);

        let start = tokio::time::Instant::now();
        assert!(syncer.sync(&cache, true).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_skips_wait_when_up_to_date() {
        let (_dir, store) = open_store();
        let cache = thread(&store);
        let local = record("thread_a", 100, 1);
        cache.put_record(&local).await.unwrap();

        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(peer(1), FakePeer::default());
        fake.set_delay(&peer(1), Duration::from_secs(100));
        let syncer = syncer(fake, store, &[1]);
        syncer.recent().append(&local.head).await.unwrap();

        let start = tokio::time::Instant::now();
        assert!(!syncer.sync(&cache, true).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sync_all_subscribed_threads() {
        let (_dir, store) = open_store();
        let a = thread(&store);
        let b = ThreadCache::new("thread_b", store.clone()).unwrap();
        let c = ThreadCache::new("thread_c", store.clone()).unwrap();
        a.subscribe(NOW).await.unwrap();
        b.subscribe(NOW).await.unwrap();

        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: vec![
                    record("thread_a", 10, 1),
                    record("thread_b", 20, 2),
                    record("thread_c", 30, 3),
                ],
                ..FakePeer::default()
            },
        );
        let syncer = syncer(fake, store, &[1]);

        assert_eq!(syncer.sync_all().await, 2);
        assert!(a.has_record().await);
        assert!(b.has_record().await);
        // Not subscribed, not synced.
        assert!(!c.has_record().await);
    }

    #[tokio::test]
    async fn test_follow_recent_subscribes_known_threads() {
        let (_dir, store) = open_store();
        let fake = Arc::new(FakeNetwork::default());
        fake.add_peer(
            peer(1),
            FakePeer {
                records: vec![record("thread_a", 10, 1), record("thread_b", 20, 2)],
                ..FakePeer::default()
            },
        );
        let syncer = syncer(fake, store.clone(), &[1]);

        assert_eq!(syncer.follow(["thread_a", "bad name"]).await, 1);
        syncer.refresh(true).await;
        assert_eq!(syncer.follow_recent().await, 1);
        assert_eq!(syncer.follow_recent().await, 0);

        assert_eq!(syncer.sync_all().await, 2);
        let b = ThreadCache::new("thread_b", store).unwrap();
        assert!(b.is_subscribed().await);
        assert!(b.has_record().await);
    }
}
