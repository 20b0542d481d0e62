//! URL-keyed cache of extracted page content.
//!
//! Keys are SHA-256 digests of the source URL; entries expire after a
//! TTL (default 24h) and the cache evicts its oldest entries once a
//! size bound is reached. A hit skips both the network fetch and the
//! extraction pass.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::ExtractedFields;

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default entry bound.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    fields: ExtractedFields,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate over all lookups, 0.0 when the cache is cold.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
    expirations: u64,
}

/// TTL-bounded cache of extracted fields keyed by URL hash.
pub struct ContentCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ContentCache {
    /// Creates a cache with the given TTL and entry bound.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                insertions: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// Digest used as the cache key for a URL.
    pub fn key_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Looks up the entry for a URL, expiring it if stale.
    pub fn get(&self, url: &str) -> Option<ExtractedFields> {
        let key = Self::key_for(url);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        match inner.entries.get_mut(&key) {
            Some(entry) if now.duration_since(entry.inserted_at) <= self.ttl => {
                entry.last_accessed = now;
                let fields = entry.fields.clone();
                inner.hits += 1;
                Some(fields)
            }
            Some(_) => {
                inner.entries.remove(&key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores extracted fields for a URL, evicting the least recently
    /// used entry when full.
    pub fn insert(&self, url: &str, fields: ExtractedFields) {
        let key = Self::key_for(url);
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                debug!("Evicted least recently used cache entry");
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                fields,
                inserted_at: now,
                last_accessed: now,
            },
        );
        inner.insertions += 1;
    }

    /// Drops all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a stats snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            insertions: inner.insertions,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn fields(description: &str) -> ExtractedFields {
        ExtractedFields {
            description: description.to_string(),
            salary: None,
            keywords: BTreeSet::new(),
        }
    }

    #[test]
    fn test_key_is_stable_and_distinct() {
        let a = ContentCache::key_for("http://example.com/a");
        let b = ContentCache::key_for("http://example.com/b");
        assert_eq!(a, ContentCache::key_for("http://example.com/a"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hit_after_insert() {
        let cache = ContentCache::default();
        assert!(cache.get("http://example.com/j1").is_none());

        cache.insert("http://example.com/j1", fields("We are hiring."));
        let hit = cache.get("http://example.com/j1").expect("cache hit");
        assert_eq!(hit.description, "We are hiring.");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ContentCache::new(Duration::from_millis(0), 16);
        cache.insert("http://example.com/j1", fields("stale"));
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("http://example.com/j1").is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_at_capacity() {
        let cache = ContentCache::new(DEFAULT_CACHE_TTL, 2);
        cache.insert("http://example.com/a", fields("a"));
        cache.insert("http://example.com/b", fields("b"));
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get("http://example.com/a");
        cache.insert("http://example.com/c", fields("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("http://example.com/a").is_some());
        assert!(cache.get("http://example.com/b").is_none());
        assert!(cache.get("http://example.com/c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = ContentCache::new(Duration::from_millis(0), 16);
        cache.insert("http://example.com/a", fields("a"));
        cache.insert("http://example.com/b", fields("b"));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }
}
