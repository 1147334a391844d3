//! Process-wide table of live download managers, one per datfile.

use crate::download::DownloadManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) type ManagerTable = Mutex<HashMap<String, Arc<DownloadManager>>>;

/// Hands out the live [`DownloadManager`] of a datfile, creating it when
/// none exists. Managers remove themselves once they converge.
#[derive(Debug, Clone, Default)]
pub struct ManagerRegistry {
    table: Arc<ManagerTable>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the download of `datfile` in progress, or start one that treats
    /// `local_keys` (`stamp_id`) as already stored.
    pub async fn obtain(
        &self,
        datfile: &str,
        local_keys: impl IntoIterator<Item = String>,
    ) -> Arc<DownloadManager> {
        let mut managers = self.table.lock().await;
        if let Some(manager) = managers.get(datfile) {
            tracing::info!("{} is downloading", datfile);
            return manager.clone();
        }
        let manager = Arc::new(DownloadManager::with_registry(
            datfile,
            local_keys,
            Arc::downgrade(&self.table),
        ));
        managers.insert(datfile.to_string(), manager.clone());
        manager
    }

    /// Whether a download of `datfile` is in progress.
    pub async fn is_active(&self, datfile: &str) -> bool {
        self.table.lock().await.contains_key(datfile)
    }

    /// Number of downloads in progress.
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}
