//! In-memory ordered table of namespaces.

use crate::record::Mutation;
use std::collections::BTreeMap;

type Namespace = BTreeMap<String, Vec<u8>>;

/// `namespace -> (key -> value)`, both levels kept in ascending key order.
#[derive(Debug, Default)]
pub struct Memtable {
    namespaces: BTreeMap<String, Namespace>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&[u8]> {
        self.namespaces
            .get(namespace)?
            .get(key)
            .map(Vec::as_slice)
    }

    /// Entries of `namespace` whose key starts with `prefix`, ascending.
    pub fn scan_prefix<'a>(
        &'a self,
        namespace: &str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
        self.namespaces
            .get(namespace)
            .into_iter()
            .flat_map(move |ns| {
                ns.range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
                    .take_while(move |(k, _)| k.starts_with(prefix))
            })
    }

    /// Apply one mutation. Empty namespaces are dropped.
    pub fn apply(&mut self, mutation: Mutation) {
        match mutation.value {
            Some(value) => {
                self.namespaces
                    .entry(mutation.namespace)
                    .or_default()
                    .insert(mutation.key, value);
            }
            None => {
                if let Some(ns) = self.namespaces.get_mut(&mutation.namespace) {
                    ns.remove(&mutation.key);
                    if ns.is_empty() {
                        self.namespaces.remove(&mutation.namespace);
                    }
                }
            }
        }
    }

    /// Number of keys in one namespace.
    pub fn namespace_len(&self, namespace: &str) -> usize {
        self.namespaces.get(namespace).map_or(0, BTreeMap::len)
    }

    /// Number of keys across all namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}
