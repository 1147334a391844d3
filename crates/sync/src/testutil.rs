//! Shared fixtures for unit tests: record builders, stores and an
//! in-process fake network of peers.

use datsync_common::{Peer, RecentLine, Record, RecordHead, Stamp};
use datsync_peer::{PeerRequest, PeerTransport, TalkError, HAVE_YES};
use datsync_storage::{FsyncPolicy, Store};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub fn id(n: u32) -> String {
    format!("{:032x}", n)
}

pub fn head(datfile: &str, stamp: Stamp, n: u32) -> RecordHead {
    RecordHead::new(datfile, &id(n), stamp).unwrap()
}

pub fn record(datfile: &str, stamp: Stamp, n: u32) -> Record {
    Record {
        head: head(datfile, stamp, n),
        body: vec![
            ("name".to_string(), "anon".to_string()),
            ("body".to_string(), format!("post {}", n)),
        ],
    }
}

pub fn peer(port: u16) -> Peer {
    format!("127.0.0.1:{}/server.cgi", port).parse().unwrap()
}

pub fn open_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), FsyncPolicy::None).unwrap();
    (dir, store)
}

/// What one fake peer holds.
#[derive(Debug, Default, Clone)]
pub struct FakePeer {
    pub records: Vec<Record>,
    /// Extra `/recent` lines, returned verbatim.
    pub recent: Vec<String>,
    /// Answer `/have` with `YES` even without records.
    pub claims_have: bool,
}

/// In-process network answering the four requests from [`FakePeer`]s.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    peers: Mutex<HashMap<Peer, FakePeer>>,
    down: Mutex<HashSet<Peer>>,
    failing_kinds: Mutex<HashSet<&'static str>>,
    /// Requests of a kind answered normally before that kind starts failing.
    failing_after: Mutex<HashMap<&'static str, usize>>,
    delays: Mutex<HashMap<Peer, Duration>>,
    calls: Mutex<Vec<(Peer, PeerRequest)>>,
}

impl FakeNetwork {
    pub fn add_peer(&self, peer: Peer, state: FakePeer) {
        self.peers.lock().unwrap().insert(peer, state);
    }

    pub fn set_down(&self, peer: &Peer) {
        self.down.lock().unwrap().insert(peer.clone());
    }

    pub fn fail_kind(&self, kind: &'static str) {
        self.failing_kinds.lock().unwrap().insert(kind);
    }

    /// Answer the first `n` requests of `kind`, then fail the rest.
    pub fn fail_kind_after(&self, kind: &'static str, n: usize) {
        self.failing_after.lock().unwrap().insert(kind, n);
    }

    /// Delay every answer from `peer` by `delay`.
    pub fn set_delay(&self, peer: &Peer, delay: Duration) {
        self.delays.lock().unwrap().insert(peer.clone(), delay);
    }

    pub fn calls(&self) -> Vec<(Peer, PeerRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.kind() == kind)
            .count()
    }

    fn answer(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.clone(), request.clone()));
        let exhausted = match self.failing_after.lock().unwrap().get(request.kind()) {
            Some(n) => self.count(request.kind()) > *n,
            None => false,
        };
        if exhausted
            || self.down.lock().unwrap().contains(peer)
            || self.failing_kinds.lock().unwrap().contains(request.kind())
        {
            return Err(TalkError::Failed("unreachable".into()));
        }
        let peers = self.peers.lock().unwrap();
        let state = peers
            .get(peer)
            .ok_or_else(|| TalkError::Failed("unknown peer".into()))?;

        let of = |datfile: &str| {
            state
                .records
                .iter()
                .filter(|r| r.head.datfile == datfile)
                .cloned()
                .collect::<Vec<_>>()
        };
        let lines = match request {
            PeerRequest::Recent { begin } => {
                let mut lines: Vec<String> = state
                    .records
                    .iter()
                    .filter(|r| r.head.stamp >= *begin)
                    .map(|r| {
                        RecentLine {
                            head: r.head.clone(),
                            tags: r.tags(),
                        }
                        .to_line()
                    })
                    .collect();
                lines.extend(state.recent.iter().cloned());
                lines
            }
            PeerRequest::Head { datfile, begin } => of(datfile)
                .iter()
                .filter(|r| r.head.stamp >= *begin)
                .map(|r| r.head.head_line())
                .collect(),
            PeerRequest::Have { datfile } => {
                if state.claims_have || !of(datfile).is_empty() {
                    vec![HAVE_YES.to_string()]
                } else {
                    Vec::new()
                }
            }
            PeerRequest::Get { datfile, from, to } => of(datfile)
                .iter()
                .filter(|r| *from <= r.head.stamp && r.head.stamp <= *to)
                .map(Record::to_line)
                .collect(),
        };
        Ok(lines)
    }
}

#[async_trait::async_trait]
impl PeerTransport for FakeNetwork {
    async fn talk(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError> {
        let delay = self.delays.lock().unwrap().get(peer).copied();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.answer(peer, request)
    }
}
