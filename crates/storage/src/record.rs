//! WAL entry format.

use serde::{Deserialize, Serialize};

/// A single key change inside a namespace. `value: None` deletes the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub namespace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl Mutation {
    pub fn put(namespace: &str, key: &str, value: Vec<u8>) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: Some(value),
        }
    }

    pub fn delete(namespace: &str, key: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: None,
        }
    }
}

/// All mutations of one committed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub mutations: Vec<Mutation>,
    /// Wall-clock commit time (millis since epoch).
    pub timestamp_ms: u64,
}

impl WalEntry {
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self {
            mutations,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}
