//! datsync-sync: the replication engine.
//!
//! - [`recent`]: time-windowed directory of recently active datfiles
//! - [`download`]: per-datfile download bookkeeping ([`DownloadManager`])
//! - [`registry`]: at most one live manager per datfile
//! - [`fetch`]: the probe / pull conversation with a single peer
//! - [`orchestrator`]: fans a download out over many peers
//! - [`cache`]: local thread storage and record ingestion
//! - [`suggest`]: suggested tags gathered from recent lines

pub mod cache;
pub mod clock;
pub mod download;
pub mod fetch;
pub mod network;
pub mod orchestrator;
pub mod recent;
pub mod registry;
pub mod suggest;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::ThreadCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use download::{Batch, DownloadManager, StampRange};
pub use network::Network;
pub use orchestrator::Syncer;
pub use recent::RecentIndex;
pub use registry::ManagerRegistry;
pub use suggest::{SuggestedTags, TagSuggester};

/// Maximum number of peers contacted by one fan-out.
pub const DEFAULT_SEARCH_DEPTH: usize = 100;

/// Tunables shared by the recent index and the orchestrator (seconds).
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Retention window of the recent index. `<= 0` disables pruning.
    pub recent_range: i64,
    /// Window used to bound `/head` probes. `0` asks for everything.
    pub get_range: i64,
    /// Window of a non-full `/recent` refresh.
    pub update_range: i64,
    /// Peer fan-out cap.
    pub search_depth: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            recent_range: 31 * 24 * 60 * 60,
            get_range: 31 * 24 * 60 * 60,
            update_range: 24 * 60 * 60,
            search_depth: DEFAULT_SEARCH_DEPTH,
        }
    }
}
