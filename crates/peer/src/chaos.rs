//! Chaos injection wrapper for [`PeerTransport`].
//!
//! [`ChaosTransport`] wraps any `T: PeerTransport` and injects
//! configurable failures: random errors, per-peer failures, and latency.

use crate::rpc::{PeerRequest, PeerTransport, TalkError};
use datsync_common::Peer;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for transport chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`PeerTransport`] wrapper that injects chaos.
pub struct ChaosTransport<T: PeerTransport> {
    inner: Arc<T>,
    config: RwLock<ChaosConfig>,
    failed_peers: RwLock<HashSet<Peer>>,
    /// Requests of these kinds always fail (e.g. only `get`).
    failed_kinds: RwLock<HashSet<&'static str>>,
    injected: AtomicUsize,
}

impl<T: PeerTransport> std::fmt::Debug for ChaosTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport")
            .field("injected", &self.injected)
            .finish_non_exhaustive()
    }
}

impl<T: PeerTransport> ChaosTransport<T> {
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: RwLock::new(config),
            failed_peers: RwLock::new(HashSet::new()),
            failed_kinds: RwLock::new(HashSet::new()),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    /// Make every request to `peer` fail until recovered.
    pub async fn fail_peer(&self, peer: Peer) {
        self.failed_peers.write().await.insert(peer);
    }

    pub async fn recover_peer(&self, peer: &Peer) {
        self.failed_peers.write().await.remove(peer);
    }

    /// Make every request of `kind` (see [`PeerRequest::kind`]) fail.
    pub async fn fail_kind(&self, kind: &'static str) {
        self.failed_kinds.write().await.insert(kind);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    async fn maybe_fail(&self, peer: &Peer, request: &PeerRequest) -> Result<(), TalkError> {
        if self.failed_peers.read().await.contains(peer)
            || self.failed_kinds.read().await.contains(request.kind())
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("chaos: failing {} request to {}", request.kind(), peer);
            return Err(TalkError::Failed("chaos: peer marked as failed".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(TalkError::Failed("chaos: random failure".into()));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: PeerTransport> PeerTransport for ChaosTransport<T> {
    async fn talk(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError> {
        self.maybe_fail(peer, request).await?;
        self.inner.talk(peer, request).await
    }
}
