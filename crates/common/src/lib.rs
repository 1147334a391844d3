//! datsync-common: shared types for the datsync project.
//!
//! Provides the `Stamp` clock type, the `Peer` address newtype and the
//! record identity types (`RecordHead`, `Record`) together with the line
//! codecs peers use to exchange them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seconds since the Unix epoch. Used both as timestamp and as sort key.
pub type Stamp = i64;

/// Number of hex characters in a record id.
pub const ID_HEX_LEN: usize = 32;

/// Field separator inside a record line.
pub const FIELD_SEP: &str = "<>";

/// Current wall-clock time as a `Stamp`.
pub fn now_stamp() -> Stamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as Stamp
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record line: {0:?}")]
    Malformed(String),

    #[error("invalid stamp: {0:?}")]
    InvalidStamp(String),

    #[error("invalid record id: {0:?}")]
    InvalidId(String),

    #[error("invalid datfile name: {0:?}")]
    InvalidDatfile(String),

    #[error("stamp {stamp} outside requested range {from}-{to}")]
    OutOfRange { stamp: Stamp, from: Stamp, to: Stamp },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer address: {0:?}")]
pub struct ParsePeerError(pub String);

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Address of a remote peer, `host:port/path` (e.g. `10.0.0.2:8000/server.cgi`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer(String);

impl Peer {
    /// Build a peer from a socket address and the path prefix it serves under.
    pub fn from_parts(addr: std::net::SocketAddr, path: &str) -> Self {
        Self(format!("{}{}", addr, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Peer {
    type Err = ParsePeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host_port, _) = s.split_once('/').unwrap_or((s, ""));
        let valid = match host_port.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        };
        if !valid || s.chars().any(char::is_whitespace) {
            return Err(ParsePeerError(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// RecordHead
// ---------------------------------------------------------------------------

/// Immutable identity of a record: which thread, which content hash, when.
///
/// Ordered by stamp, ties broken by id (then datfile).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordHead {
    pub datfile: String,
    pub id: String,
    pub stamp: Stamp,
}

impl RecordHead {
    /// Create a head after validating every component.
    pub fn new(datfile: &str, id: &str, stamp: Stamp) -> Result<Self, RecordError> {
        validate_datfile(datfile)?;
        validate_id(id)?;
        if stamp < 0 {
            return Err(RecordError::InvalidStamp(stamp.to_string()));
        }
        Ok(Self {
            datfile: datfile.to_string(),
            id: id.to_string(),
            stamp,
        })
    }

    /// Key identifying the record within its datfile: `stamp_id`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.stamp, self.id)
    }

    /// Key under which the head is indexed across datfiles:
    /// `datfile:zero-padded-stamp_id`. Lexicographic order equals
    /// chronological order within one datfile.
    pub fn index_key(&self) -> String {
        format!("{}{:020}_{}", datfile_prefix(&self.datfile), self.stamp, self.id)
    }

    /// Parse a `/head` response line (`stamp<>id`) for `datfile`.
    pub fn parse_head_line(line: &str, datfile: &str) -> Result<Self, RecordError> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(FIELD_SEP);
        let stamp = fields
            .next()
            .ok_or_else(|| RecordError::Malformed(line.to_string()))?;
        let id = fields
            .next()
            .ok_or_else(|| RecordError::Malformed(line.to_string()))?;
        Self::new(datfile, id, parse_stamp(stamp)?)
    }

    /// Render as a `/head` response line.
    pub fn head_line(&self) -> String {
        format!("{}{}{}", self.stamp, FIELD_SEP, self.id)
    }
}

impl Ord for RecordHead {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.datfile.cmp(&other.datfile))
    }
}

impl PartialOrd for RecordHead {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Prefix shared by every index key of `datfile`.
pub fn datfile_prefix(datfile: &str) -> String {
    format!("{}:", datfile)
}

// ---------------------------------------------------------------------------
// Recent lines
// ---------------------------------------------------------------------------

/// One line of a `/recent` response: a head plus the tags announced for
/// its thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentLine {
    pub head: RecordHead,
    pub tags: Vec<String>,
}

impl RecentLine {
    /// Parse `stamp<>id<>datfile[<>tag:t1 t2]`.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(FIELD_SEP).collect();
        if fields.len() < 3 {
            return Err(RecordError::Malformed(line.to_string()));
        }
        let head = RecordHead::new(fields[2], fields[1], parse_stamp(fields[0])?)?;
        let tags = fields[3..]
            .iter()
            .filter_map(|f| f.strip_prefix("tag:"))
            .flat_map(str::split_whitespace)
            .map(str::to_string)
            .collect();
        Ok(Self { head, tags })
    }

    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}{sep}{}{sep}{}",
            self.head.stamp,
            self.head.id,
            self.head.datfile,
            sep = FIELD_SEP
        );
        if !self.tags.is_empty() {
            line.push_str(FIELD_SEP);
            line.push_str("tag:");
            line.push_str(&self.tags.join(" "));
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A full record: head plus ordered `name:value` body fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub head: RecordHead,
    pub body: Vec<(String, String)>,
}

impl Record {
    /// Parse a `/get` response line (`stamp<>id<>name:value<>...`) for `datfile`.
    pub fn parse(line: &str, datfile: &str) -> Result<Self, RecordError> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(FIELD_SEP);
        let (stamp, id) = match (fields.next(), fields.next()) {
            (Some(stamp), Some(id)) => (stamp, id),
            _ => return Err(RecordError::Malformed(line.to_string())),
        };
        let head = RecordHead::new(datfile, id, parse_stamp(stamp)?)?;
        let body = fields
            .map(|f| {
                f.split_once(':')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| RecordError::Malformed(line.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { head, body })
    }

    /// Value of the first body field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.body
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whitespace separated tags carried in the `tag` field.
    pub fn tags(&self) -> Vec<String> {
        self.field("tag")
            .map(|t| t.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn to_line(&self) -> String {
        let mut line = self.head.head_line();
        for (k, v) in &self.body {
            line.push_str(FIELD_SEP);
            line.push_str(k);
            line.push(':');
            line.push_str(v);
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn parse_stamp(s: &str) -> Result<Stamp, RecordError> {
    match s.parse::<Stamp>() {
        Ok(stamp) if stamp >= 0 => Ok(stamp),
        _ => Err(RecordError::InvalidStamp(s.to_string())),
    }
}

fn validate_id(id: &str) -> Result<(), RecordError> {
    let lower = id.bytes().all(|b| !b.is_ascii_uppercase());
    if id.len() != ID_HEX_LEN || !lower || hex::decode(id).is_err() {
        return Err(RecordError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// A datfile name must be non-empty and free of separators.
pub fn validate_datfile(datfile: &str) -> Result<(), RecordError> {
    let bad = |c: char| c == ':' || c == '/' || c.is_whitespace();
    if datfile.is_empty() || datfile.contains(FIELD_SEP) || datfile.chars().any(bad) {
        return Err(RecordError::InvalidDatfile(datfile.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "0123456789abcdef0123456789abcdef";
    const ID_B: &str = "fedcba9876543210fedcba9876543210";

    #[test]
    fn test_parse_head_line() {
        let head = RecordHead::parse_head_line(&format!("1500<>{}", ID_A), "thread_a").unwrap();
        assert_eq!(head.stamp, 1500);
        assert_eq!(head.id, ID_A);
        assert_eq!(head.datfile, "thread_a");
        assert_eq!(head.head_line(), format!("1500<>{}", ID_A));
    }

    #[test]
    fn test_parse_head_line_rejects_garbage() {
        assert!(RecordHead::parse_head_line("", "thread_a").is_err());
        assert!(RecordHead::parse_head_line("abc<>def", "thread_a").is_err());
        assert!(RecordHead::parse_head_line(&format!("-5<>{}", ID_A), "thread_a").is_err());
        assert!(matches!(
            RecordHead::parse_head_line("10<>XYZ", "thread_a"),
            Err(RecordError::InvalidId(_))
        ));
        let upper = ID_A.to_uppercase();
        assert!(RecordHead::parse_head_line(&format!("10<>{}", upper), "thread_a").is_err());
    }

    #[test]
    fn test_index_key_orders_chronologically() {
        let early = RecordHead::new("thread_a", ID_B, 9).unwrap();
        let late = RecordHead::new("thread_a", ID_A, 10).unwrap();
        assert!(early.index_key() < late.index_key());
        assert!(early < late);
        assert!(late.index_key().starts_with(&datfile_prefix("thread_a")));
    }

    #[test]
    fn test_head_tie_break_by_id() {
        let a = RecordHead::new("thread_a", ID_A, 10).unwrap();
        let b = RecordHead::new("thread_a", ID_B, 10).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_recent_line_with_tags() {
        let line = format!("42<>{}<>thread_x<>tag:rust p2p", ID_A);
        let recent = RecentLine::parse(&line).unwrap();
        assert_eq!(recent.head.datfile, "thread_x");
        assert_eq!(recent.head.stamp, 42);
        assert_eq!(recent.tags, vec!["rust", "p2p"]);
        assert_eq!(recent.to_line(), line);
    }

    #[test]
    fn test_recent_line_without_tags() {
        let recent = RecentLine::parse(&format!("42<>{}<>thread_x", ID_A)).unwrap();
        assert!(recent.tags.is_empty());
        assert!(RecentLine::parse(&format!("42<>{}", ID_A)).is_err());
    }

    #[test]
    fn test_record_parse_and_fields() {
        let line = format!("77<>{}<>name:anon<>body:hello:world<>tag:a b", ID_A);
        let record = Record::parse(&line, "thread_x").unwrap();
        assert_eq!(record.head.stamp, 77);
        assert_eq!(record.field("name"), Some("anon"));
        assert_eq!(record.field("body"), Some("hello:world"));
        assert_eq!(record.tags(), vec!["a", "b"]);
        assert_eq!(record.to_line(), line);
    }

    #[test]
    fn test_record_rejects_fieldless_body_entry() {
        let line = format!("77<>{}<>nocolon", ID_A);
        assert!(matches!(
            Record::parse(&line, "thread_x"),
            Err(RecordError::Malformed(_))
        ));
    }

    #[test]
    fn test_datfile_validation() {
        assert!(validate_datfile("thread_4E6577").is_ok());
        assert!(validate_datfile("").is_err());
        assert!(validate_datfile("a:b").is_err());
        assert!(validate_datfile("a/b").is_err());
        assert!(validate_datfile("a b").is_err());
    }

    #[test]
    fn test_peer_parse() {
        let peer: Peer = "127.0.0.1:8000/server.cgi".parse().unwrap();
        assert_eq!(peer.as_str(), "127.0.0.1:8000/server.cgi");
        assert!("example.org:80".parse::<Peer>().is_ok());
        assert!("no-port/server.cgi".parse::<Peer>().is_err());
        assert!("host:notaport/x".parse::<Peer>().is_err());
        assert!(":80/x".parse::<Peer>().is_err());

        let addr: std::net::SocketAddr = "10.0.0.1:9000".parse().unwrap();
        assert_eq!(
            Peer::from_parts(addr, "/server.cgi").as_str(),
            "10.0.0.1:9000/server.cgi"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let head = RecordHead::new("thread_a", ID_A, 5).unwrap();
        let json = serde_json::to_string(&head).unwrap();
        let back: RecordHead = serde_json::from_str(&json).unwrap();
        assert_eq!(head, back);

        let peer: Peer = "127.0.0.1:1/p".parse().unwrap();
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(serde_json::from_str::<Peer>(&json).unwrap(), peer);
    }
}
