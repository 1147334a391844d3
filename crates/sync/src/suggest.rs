//! Suggested tags per datfile, collected from tags peers announce in
//! their `/recent` lines.

use datsync_common::RecordHead;
use datsync_storage::{ReadView, StorageError, WriteTx};
use std::collections::HashSet;

/// Storage namespace for suggested tags, keyed by datfile.
pub const SUGTAG_NS: &str = "sugtag";

/// Receives tag annotations discovered while refreshing the recent index.
pub trait TagSuggester: Send + Sync + 'static {
    /// Record `tags` as suggestions for `datfile`.
    fn add_tags(&self, tx: &mut WriteTx<'_>, datfile: &str, tags: &[String])
        -> Result<(), StorageError>;

    /// Drop suggestions for datfiles absent from `heads`. Returns how many
    /// datfiles were dropped.
    fn prune(&self, tx: &mut WriteTx<'_>, heads: &[RecordHead]) -> Result<usize, StorageError>;
}

/// [`TagSuggester`] keeping the newest `max_tags` distinct tags per datfile.
#[derive(Debug, Clone)]
pub struct SuggestedTags {
    max_tags: usize,
}

impl SuggestedTags {
    pub fn new(max_tags: usize) -> Self {
        Self { max_tags }
    }

    /// Suggestions for `datfile`, newest first.
    pub fn get<V: ReadView>(view: &V, datfile: &str) -> Vec<String> {
        match view.get_json::<Vec<String>>(SUGTAG_NS, datfile) {
            Ok(tags) => tags.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("unreadable tag suggestions for {}: {}", datfile, e);
                Vec::new()
            }
        }
    }
}

impl TagSuggester for SuggestedTags {
    fn add_tags(
        &self,
        tx: &mut WriteTx<'_>,
        datfile: &str,
        tags: &[String],
    ) -> Result<(), StorageError> {
        if tags.is_empty() {
            return Ok(());
        }
        let existing = Self::get(&*tx, datfile);
        let mut merged: Vec<String> = Vec::with_capacity(tags.len() + existing.len());
        for tag in tags.iter().chain(existing.iter()) {
            if !merged.contains(tag) {
                merged.push(tag.clone());
            }
        }
        merged.truncate(self.max_tags);
        tx.put_json(SUGTAG_NS, datfile, &merged)
    }

    fn prune(&self, tx: &mut WriteTx<'_>, heads: &[RecordHead]) -> Result<usize, StorageError> {
        let live: HashSet<&str> = heads.iter().map(|h| h.datfile.as_str()).collect();
        let stale: Vec<String> = tx
            .scan_prefix(SUGTAG_NS, "")
            .into_iter()
            .map(|(datfile, _)| datfile)
            .filter(|datfile| !live.contains(datfile.as_str()))
            .collect();
        for datfile in &stale {
            tx.delete(SUGTAG_NS, datfile);
        }
        Ok(stale.len())
    }
}
