//! Persistent stores: the search result cache and the append-only search
//! history, both sled trees inside one database.

pub mod cache;
pub mod history;

pub use cache::{CacheStats, CachedSearch, SearchCache};
pub use history::{HistoryRecord, SearchHistory};

use crate::config::StorageSettings;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CACHE_TREE: &str = "search_cache";
const HISTORY_TREE: &str = "search_history";

/// Handle to the storage database and its trees.
pub struct Storage {
    cache: Arc<SearchCache>,
    history: Arc<SearchHistory>,
}

impl Storage {
    /// Open at the configured path, or as a temporary database when no
    /// path is set (tests, ephemeral deployments).
    pub fn open(settings: &StorageSettings, cache_ttl: Duration) -> Result<Self> {
        let db = match &settings.path {
            Some(path) => sled::Config::new().path(path).open()?,
            None => sled::Config::new().temporary(true).open()?,
        };
        info!(
            path = ?settings.path,
            "storage opened"
        );
        let cache = Arc::new(SearchCache::new(db.open_tree(CACHE_TREE)?, cache_ttl));
        let history_tree = db.open_tree(HISTORY_TREE)?;
        let history = Arc::new(SearchHistory::new(db, history_tree));
        Ok(Self { cache, history })
    }

    #[must_use]
    pub fn cache(&self) -> Arc<SearchCache> {
        self.cache.clone()
    }

    #[must_use]
    pub fn history(&self) -> Arc<SearchHistory> {
        self.history.clone()
    }

    /// Spawn the periodic expired-entry sweep.
    pub fn spawn_cleanup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = cache.cleanup_expired() {
                    tracing::warn!(%err, "cache sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_temporary_storage_without_a_path() {
        let storage = Storage::open(&StorageSettings::default(), Duration::from_secs(60)).unwrap();
        assert!(storage.history().is_empty());
        assert_eq!(storage.cache().stats().size, 0);
    }
}
