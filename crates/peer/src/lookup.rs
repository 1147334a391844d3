//! Affinity table: which peers are known to serve which datfile.
//!
//! Also tracks the set of all known peers, from which random samples are
//! drawn when no affinity is known yet. Shared as `Arc<RwLock<LookupTable>>`.

use datsync_common::Peer;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub struct LookupTable {
    /// Every peer we know of, in discovery order.
    nodes: Vec<Peer>,
    /// datfile -> peers that served it, most recently confirmed last.
    table: BTreeMap<String, Vec<Peer>>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table seeded with initial peers.
    pub fn with_nodes(nodes: impl IntoIterator<Item = Peer>) -> Self {
        let mut table = Self::new();
        for peer in nodes {
            table.add_node(peer);
        }
        table
    }

    /// Add a known peer. Returns `false` if it was already known.
    pub fn add_node(&mut self, peer: Peer) -> bool {
        if self.nodes.contains(&peer) {
            return false;
        }
        self.nodes.push(peer);
        true
    }

    /// All known peers.
    pub fn nodes(&self) -> &[Peer] {
        &self.nodes
    }

    /// Remember that `peer` serves `datfile`.
    pub fn remember(&mut self, datfile: &str, peer: &Peer) {
        self.add_node(peer.clone());
        let peers = self.table.entry(datfile.to_string()).or_default();
        peers.retain(|p| p != peer);
        peers.push(peer.clone());
    }

    /// Forget that `peer` serves `datfile`.
    pub fn forget(&mut self, datfile: &str, peer: &Peer) {
        if let Some(peers) = self.table.get_mut(datfile) {
            peers.retain(|p| p != peer);
            if peers.is_empty() {
                self.table.remove(datfile);
            }
        }
    }

    /// Drop `peer` from every datfile entry. It stays a known node and may
    /// be sampled again later.
    pub fn forget_everywhere(&mut self, peer: &Peer) {
        self.table.retain(|_, peers| {
            peers.retain(|p| p != peer);
            !peers.is_empty()
        });
    }

    /// Peers known to serve `datfile`, most recently confirmed first.
    pub fn known_for(&self, datfile: &str) -> Vec<Peer> {
        self.table
            .get(datfile)
            .map(|peers| peers.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Up to `n` peers to ask about `datfile`: affinity peers first, then
    /// randomly sampled known peers.
    pub fn candidates_for(&self, datfile: &str, n: usize) -> Vec<Peer> {
        let mut candidates = self.known_for(datfile);
        candidates.truncate(n);
        if candidates.len() < n {
            let chosen: HashSet<Peer> = candidates.iter().cloned().collect();
            let mut rest: Vec<&Peer> = self.nodes.iter().filter(|p| !chosen.contains(p)).collect();
            rest.shuffle(&mut rand::thread_rng());
            candidates.extend(rest.into_iter().take(n - candidates.len()).cloned());
        }
        candidates
    }

    /// Up to `n` distinct known peers, chosen at random.
    pub fn random_peers(&self, n: usize) -> Vec<Peer> {
        self.nodes
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect()
    }

    /// Datfiles with at least one known peer.
    pub fn datfiles(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }
}
