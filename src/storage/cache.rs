use crate::models::ProviderName;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// A cached, serialized search response keyed by the query fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSearch {
    pub query_hash: String,
    pub query: String,
    /// The response exactly as serialized; replays are byte-identical.
    pub response_json: Vec<u8>,
    pub result_count: u32,
    pub providers: Vec<ProviderName>,
    pub expires_at: i64,
    pub created_at: i64,
    pub access_count: u64,
    pub last_access: i64,
}

impl CachedSearch {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Sled-backed search result cache with TTL, access accounting and lazy
/// garbage collection. Expired entries are logically absent.
pub struct SearchCache {
    tree: sled::Tree,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SearchCache {
    #[must_use]
    pub fn new(tree: sled::Tree, default_ttl: Duration) -> Self {
        Self {
            tree,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up by fingerprint. A hit bumps the access counters and is
    /// written back; an expired entry is removed and reported as a miss.
    pub fn get(&self, query_hash: &str) -> Result<Option<CachedSearch>> {
        let Some(raw) = self.tree.get(query_hash.as_bytes())? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let mut entry: CachedSearch = decode(&raw)?;
        if entry.is_expired() {
            self.tree.remove(query_hash.as_bytes())?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(query_hash, "cache entry expired");
            return Ok(None);
        }

        entry.access_count += 1;
        entry.last_access = Utc::now().timestamp();
        self.tree.insert(query_hash.as_bytes(), encode(&entry)?)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    /// Insert or overwrite an entry under the fingerprint.
    pub fn set(
        &self,
        query_hash: &str,
        query: &str,
        response_json: Vec<u8>,
        result_count: u32,
        providers: Vec<ProviderName>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CachedSearch {
            query_hash: query_hash.to_string(),
            query: query.to_string(),
            response_json,
            result_count,
            providers,
            expires_at: now + ttl.as_secs() as i64,
            created_at: now,
            access_count: 0,
            last_access: now,
        };
        self.tree.insert(query_hash.as_bytes(), encode(&entry)?)?;
        Ok(())
    }

    /// Sweep every expired entry; returns how many were deleted.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let mut removed = 0_u64;
        for item in self.tree.iter() {
            let (key, value) = item?;
            let expired = match decode::<CachedSearch>(&value) {
                Ok(entry) => entry.is_expired(),
                Err(err) => {
                    warn!(%err, "dropping undecodable cache entry");
                    true
                }
            };
            if expired {
                self.tree.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.evictions.fetch_add(removed, Ordering::Relaxed);
            debug!(removed, "cache sweep removed expired entries");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.tree.len() as u64,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::other(format!("cache encode failed: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T> {
    bincode::deserialize(raw).map_err(|e| Error::other(format!("cache decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Duration) -> SearchCache {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SearchCache::new(db.open_tree("search_cache").unwrap(), ttl)
    }

    #[test]
    fn set_get_round_trip_preserves_bytes() {
        let cache = cache(Duration::from_secs(60));
        let payload = br#"{"papers":[],"total_count":0}"#.to_vec();
        cache
            .set("h1", "attention", payload.clone(), 0, vec![ProviderName::Arxiv], None)
            .unwrap();

        let entry = cache.get("h1").unwrap().unwrap();
        assert_eq!(entry.response_json, payload);
        assert_eq!(entry.access_count, 1);

        let again = cache.get("h1").unwrap().unwrap();
        assert_eq!(again.access_count, 2);
        assert_eq!(again.response_json, payload);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn expired_entries_are_misses_and_collected() {
        let cache = cache(Duration::from_secs(0));
        cache
            .set("h1", "q", vec![1, 2, 3], 1, vec![], None)
            .unwrap();

        assert!(cache.get("h1").unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = cache(Duration::from_secs(300));
        cache.set("keep", "q1", vec![1], 1, vec![], None).unwrap();
        cache
            .set("drop", "q2", vec![2], 1, vec![], Some(Duration::from_secs(0)))
            .unwrap();

        let removed = cache.cleanup_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("keep").unwrap().is_some());
        assert!(cache.get("drop").unwrap().is_none());
    }

    #[test]
    fn overwrite_on_same_hash_is_allowed() {
        let cache = cache(Duration::from_secs(60));
        cache.set("h", "q", vec![1], 1, vec![], None).unwrap();
        cache.set("h", "q", vec![2], 1, vec![], None).unwrap();
        assert_eq!(cache.get("h").unwrap().unwrap().response_json, vec![2]);
    }

    #[test]
    fn hit_rate_is_computed() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            evictions: 0,
            size: 0,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
