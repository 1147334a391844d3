//! Peer requests and the transport abstraction trait.

use datsync_common::{validate_datfile, Peer, Stamp};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request sent to a peer. Every request answers with an ordered list
/// of lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// Heads across all datfiles stamped at or after `begin`.
    Recent { begin: Stamp },
    /// Heads of one datfile stamped at or after `begin`.
    Head { datfile: String, begin: Stamp },
    /// Whether the peer holds `datfile` at all.
    Have { datfile: String },
    /// Full records of `datfile` with `from <= stamp <= to`.
    Get {
        datfile: String,
        from: Stamp,
        to: Stamp,
    },
}

/// Affirmative answer to [`PeerRequest::Have`].
pub const HAVE_YES: &str = "YES";

impl PeerRequest {
    /// Request path, relative to the peer's base path.
    pub fn path(&self) -> String {
        match self {
            PeerRequest::Recent { begin } => format!("/recent/{}-", begin),
            PeerRequest::Head { datfile, begin } => format!("/head/{}/{}-", datfile, begin),
            PeerRequest::Have { datfile } => format!("/have/{}", datfile),
            PeerRequest::Get { datfile, from, to } => format!("/get/{}/{}-{}", datfile, from, to),
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Recent { .. } => "recent",
            PeerRequest::Head { .. } => "head",
            PeerRequest::Have { .. } => "have",
            PeerRequest::Get { .. } => "get",
        }
    }

    /// Parse a request path as produced by [`PeerRequest::path`].
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.strip_prefix('/')?.split('/');
        let request = match (parts.next()?, parts.next(), parts.next()) {
            ("recent", Some(range), None) => PeerRequest::Recent {
                begin: parse_open_range(range)?,
            },
            ("head", Some(datfile), Some(range)) => PeerRequest::Head {
                datfile: datfile.to_string(),
                begin: parse_open_range(range)?,
            },
            ("have", Some(datfile), None) => PeerRequest::Have {
                datfile: datfile.to_string(),
            },
            ("get", Some(datfile), Some(range)) => {
                let (from, to) = range.split_once('-')?;
                PeerRequest::Get {
                    datfile: datfile.to_string(),
                    from: from.parse().ok()?,
                    to: to.parse().ok()?,
                }
            }
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        match &request {
            PeerRequest::Head { datfile, .. }
            | PeerRequest::Have { datfile }
            | PeerRequest::Get { datfile, .. } => validate_datfile(datfile).ok()?,
            PeerRequest::Recent { .. } => {}
        }
        Some(request)
    }
}

/// `"{begin}-"` -> `begin`.
fn parse_open_range(range: &str) -> Option<Stamp> {
    range.strip_suffix('-')?.parse().ok()
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TalkError {
    #[error("talk failed: {0}")]
    Failed(String),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("timeout")]
    Timeout,
}

/// Abstraction over the network transport used to talk to peers.
///
/// Implementations:
/// - `HttpTransport` in `datsync-net` for real deployment
/// - in-process mocks and [`ChaosTransport`](crate::chaos::ChaosTransport) in tests
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Send `request` to `peer` and return the response lines in order.
    async fn talk(&self, peer: &Peer, request: &PeerRequest) -> Result<Vec<String>, TalkError>;
}
