//! The transport plus the affinity table, bundled for the sync components.

use datsync_common::Peer;
use datsync_metrics::{metrics, start_talk_timer};
use datsync_peer::{LookupTable, PeerRequest, PeerTransport, TalkError};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct Network<T: PeerTransport> {
    transport: Arc<T>,
    lookup: Arc<RwLock<LookupTable>>,
}

impl<T: PeerTransport> Clone for Network<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            lookup: self.lookup.clone(),
        }
    }
}

impl<T: PeerTransport> std::fmt::Debug for Network<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").finish_non_exhaustive()
    }
}

impl<T: PeerTransport> Network<T> {
    pub fn new(transport: Arc<T>, lookup: Arc<RwLock<LookupTable>>) -> Self {
        Self { transport, lookup }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn lookup(&self) -> &Arc<RwLock<LookupTable>> {
        &self.lookup
    }

    /// Send `request` to `peer`, recording metrics for the exchange.
    pub async fn talk(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError> {
        let kind = request.kind();
        let m = metrics();
        m.talks_sent.with_label_values(&[kind]).inc();
        let _timer = start_talk_timer(kind);

        match self.transport.talk(peer, request).await {
            Ok(lines) => {
                tracing::debug!("{}{} -> {} line(s)", peer, request.path(), lines.len());
                Ok(lines)
            }
            Err(e) => {
                m.talk_failures.with_label_values(&[kind]).inc();
                tracing::debug!("{}{} failed: {}", peer, request.path(), e);
                Err(e)
            }
        }
    }
}
