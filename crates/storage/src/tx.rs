//! Read views and read-write transactions over the memtable.
//!
//! A [`WriteTx`] buffers its writes; its own reads see them, other readers
//! do not until the owning [`Store::update`](crate::Store::update) commits.

use crate::engine::StorageError;
use crate::memtable::Memtable;
use crate::record::Mutation;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Read operations shared by views and transactions.
pub trait ReadView {
    /// Raw value of `key` in `namespace`.
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>>;

    /// All `(key, value)` pairs of `namespace` whose key starts with
    /// `prefix`, in ascending key order.
    fn scan_prefix(&self, namespace: &str, prefix: &str) -> Vec<(String, Vec<u8>)>;

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.get(namespace, key).is_some()
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        self.get(namespace, key)
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StorageError::from)
    }

    /// Decoded values under `prefix`, ascending by key. Entries that fail to
    /// decode are skipped.
    fn scan_json<T: DeserializeOwned>(&self, namespace: &str, prefix: &str) -> Vec<(String, T)> {
        self.scan_prefix(namespace, prefix)
            .into_iter()
            .filter_map(|(k, v)| match serde_json::from_slice(&v) {
                Ok(value) => Some((k, value)),
                Err(e) => {
                    tracing::warn!("skipping undecodable {}/{}: {}", namespace, k, e);
                    None
                }
            })
            .collect()
    }
}

/// Consistent read-only view of the store.
#[derive(Debug)]
pub struct ReadTx<'a> {
    memtable: &'a Memtable,
}

impl<'a> ReadTx<'a> {
    pub(crate) fn new(memtable: &'a Memtable) -> Self {
        Self { memtable }
    }
}

impl ReadView for ReadTx<'_> {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.memtable.get(namespace, key).map(<[u8]>::to_vec)
    }

    fn scan_prefix(&self, namespace: &str, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.memtable
            .scan_prefix(namespace, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A read-write transaction. Writes are staged until commit.
#[derive(Debug)]
pub struct WriteTx<'a> {
    memtable: &'a Memtable,
    staged: BTreeMap<(String, String), Option<Vec<u8>>>,
}

impl<'a> WriteTx<'a> {
    pub(crate) fn new(memtable: &'a Memtable) -> Self {
        Self {
            memtable,
            staged: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, namespace: &str, key: &str, value: Vec<u8>) {
        self.staged
            .insert((namespace.to_string(), key.to_string()), Some(value));
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.put(namespace, key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, namespace: &str, key: &str) {
        self.staged
            .insert((namespace.to_string(), key.to_string()), None);
    }

    /// Number of staged mutations.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.staged
            .into_iter()
            .map(|((namespace, key), value)| Mutation {
                namespace,
                key,
                value,
            })
            .collect()
    }
}

impl ReadView for WriteTx<'_> {
    fn get(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        match self.staged.get(&(namespace.to_string(), key.to_string())) {
            Some(staged) => staged.clone(),
            None => self.memtable.get(namespace, key).map(<[u8]>::to_vec),
        }
    }

    fn scan_prefix(&self, namespace: &str, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let mut merged: BTreeMap<String, Vec<u8>> = self
            .memtable
            .scan_prefix(namespace, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for ((ns, key), value) in &self.staged {
            if ns != namespace || !key.starts_with(prefix) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memtable() -> Memtable {
        let mut mt = Memtable::new();
        mt.apply(Mutation::put("ns", "a1", b"1".to_vec()));
        mt.apply(Mutation::put("ns", "a2", b"2".to_vec()));
        mt.apply(Mutation::put("ns", "b1", b"3".to_vec()));
        mt
    }

    #[test]
    fn test_write_tx_sees_own_writes() {
        let mt = memtable();
        let mut tx = WriteTx::new(&mt);
        tx.put("ns", "a3", b"new".to_vec());
        tx.delete("ns", "a1");

        assert_eq!(tx.get("ns", "a3"), Some(b"new".to_vec()));
        assert!(!tx.exists("ns", "a1"));

        let keys: Vec<String> = tx.scan_prefix("ns", "a").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a2", "a3"]);

        // The base table is untouched until commit.
        assert!(mt.get("ns", "a1").is_some());
        assert!(mt.get("ns", "a3").is_none());
        assert_eq!(tx.pending(), 2);
    }

    #[test]
    fn test_json_helpers() {
        let mt = Memtable::new();
        let mut tx = WriteTx::new(&mt);
        tx.put_json("ns", "k", &vec![1u32, 2, 3]).unwrap();
        tx.put("ns", "k2", b"not json".to_vec());

        let value: Option<Vec<u32>> = tx.get_json("ns", "k").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        assert!(tx.get_json::<Vec<u32>>("ns", "k2").is_err());

        let decoded: Vec<(String, Vec<u32>)> = tx.scan_json("ns", "");
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_read_tx() {
        let mt = memtable();
        let view = ReadTx::new(&mt);
        assert_eq!(view.get("ns", "b1"), Some(b"3".to_vec()));
        assert_eq!(view.scan_prefix("ns", "a").len(), 2);
        assert!(view.get_json::<u32>("ns", "missing").unwrap().is_none());
    }
}
