//! datsync-peer: everything about talking to other peers.
//!
//! - [`rpc`]: the four wire requests and the [`PeerTransport`](rpc::PeerTransport) seam
//! - [`lookup`]: the affinity table of which peers serve which datfile
//! - [`chaos`]: a failure-injecting transport wrapper for tests

pub mod chaos;
pub mod lookup;
pub mod rpc;

pub use lookup::LookupTable;
pub use rpc::{PeerRequest, PeerTransport, TalkError, HAVE_YES};
