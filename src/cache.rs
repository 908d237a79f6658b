//! Process-wide cache of rewritten site snapshots.
//!
//! Entries are keyed by site id and lease config hash, so a snapshot rewritten
//! under one field layout is never served under another. Entries expire after
//! a fixed TTL and the least recently used entry is evicted at capacity.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::citations::CitationTable;
use crate::config::RuntimeSettings;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub site_id: String,
    pub lease_config_hash: String,
}

impl CacheKey {
    pub fn new(site_id: &str, lease_config_hash: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            lease_config_hash: lease_config_hash.to_string(),
        }
    }
}

/// A rewritten snapshot and the table that resolves its tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub rewritten_document_text: String,
    pub citation_mappings: CitationTable,
}

struct TimedEntry {
    inserted_at: Instant,
    entry: Arc<CacheEntry>,
}

pub struct SnapshotCache {
    ttl: Duration,
    entries: Mutex<LruCache<CacheKey, TimedEntry>>,
    /// One gate per key currently being built.
    in_flight: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(settings.cache_ttl, settings.cache_capacity)
    }

    /// A live entry for `key`, refreshing its recency. Expired entries are dropped.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(timed) if timed.inserted_at.elapsed() < self.ttl => {
                return Some(timed.entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            debug!(site_id = %key.site_id, "Snapshot cache entry expired");
        }
        None
    }

    /// Insert or replace the entry for `key`.
    pub async fn put(&self, key: CacheKey, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.lock().await;
        let evicted = entries.push(
            key.clone(),
            TimedEntry {
                inserted_at: Instant::now(),
                entry: entry.clone(),
            },
        );
        if let Some((evicted_key, _)) = evicted.filter(|(k, _)| *k != key) {
            debug!(site_id = %evicted_key.site_id, "Snapshot cache evicted entry");
        }
        entry
    }

    /// Return the cached entry for `key`, building it on a miss.
    ///
    /// Concurrent callers for the same key share one build: the first runs
    /// `build`, the rest wait and then read what it stored. A failed build
    /// stores nothing, and each waiter then tries its own.
    pub async fn get_or_try_build<F, Fut>(&self, key: CacheKey, build: F) -> Result<Arc<CacheEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _building = gate.lock().await;
            match self.get(&key).await {
                Some(hit) => Ok(hit),
                None => match build().await {
                    Ok(entry) => Ok(self.put(key.clone(), entry).await),
                    Err(e) => Err(e),
                },
            }
        };

        // With our handle released under the lock, a count of one means no
        // waiter still holds the gate.
        let mut in_flight = self.in_flight.lock().await;
        let ours = in_flight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &gate));
        drop(gate);
        if ours
            && in_flight
                .get(&key)
                .is_some_and(|current| Arc::strong_count(current) == 1)
        {
            in_flight.remove(&key);
        }
        result
    }

    /// Number of stored entries, expired ones included until next touched.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
