//! Response cache keyed by method name and serialized arguments.
//!
//! Entries expire after their TTL and are dropped lazily on the next probe,
//! unless the server supplied a [`Validator`] (`ETag` or `Last-Modified`):
//! such entries stay behind as stale copies that a conditional request can
//! revalidate with a `304 Not Modified`. The cache is bounded both by entry count and by the approximate byte size
//! of the cached values; over either bound the least recently populated
//! entries go first. Probing does not refresh recency.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

use crate::config::CacheConfig;

/// Cache key: method name plus its canonical JSON argument list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: String,
    args: String,
}

impl CacheKey {
    /// Key for `method` called with `args`.
    pub fn new(method: &str, args: &[Value]) -> Self {
        CacheKey {
            method: method.to_string(),
            args: serde_json::to_string(args).unwrap_or_default(),
        }
    }

    /// Method part of the key.
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Server validators for a cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    /// Value of the `ETag` response header.
    pub etag: Option<String>,
    /// Value of the `Last-Modified` response header.
    pub last_modified: Option<String>,
}

impl Validator {
    /// `None` unless at least one validator is present.
    pub fn new(etag: Option<&str>, last_modified: Option<&str>) -> Option<Self> {
        if etag.is_none() && last_modified.is_none() {
            return None;
        }
        Some(Validator {
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
        })
    }

    /// Conditional request header; the entity tag wins over the date.
    pub fn condition(&self) -> (&'static str, &str) {
        match (&self.etag, &self.last_modified) {
            (Some(etag), _) => ("If-None-Match", etag),
            (None, Some(date)) => ("If-Modified-Since", date),
            (None, None) => ("If-None-Match", "*"),
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    size: usize,
    validator: Option<Validator>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache counters and occupancy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries dropped for capacity or byte budget.
    pub evictions: u64,
    /// Entries dropped after their TTL.
    pub expirations: u64,
    /// Stale entries confirmed by a `304 Not Modified`.
    pub revalidations: u64,
    /// Entries currently held.
    pub entries: usize,
    /// Approximate size of the held values.
    pub bytes: usize,
}

struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    bytes: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, entry)) => {
                self.bytes = self.bytes.saturating_sub(entry.size);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn method_count(&self, method: &str) -> usize {
        self.entries.iter().filter(|(k, _)| k.method == method).count()
    }

    fn oldest_for_method(&self, method: &str) -> Option<CacheKey> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.method == method)
            .map(|(k, _)| k.clone())
    }
}

/// Thread-safe response cache shared by concurrent flushes.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    /// Empty cache bounded by `config`.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        ResponseCache {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                bytes: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// False when caching is switched off.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// TTL for entries whose method declares none.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_ttl_ms)
    }

    /// Look up a value; expired entries count as misses and are removed
    /// unless they carry a validator.
    pub fn probe(&self, key: &CacheKey) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = match inner.entries.peek(key) {
            Some(entry) if !entry.is_expired(now) => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Some(value);
            }
            Some(entry) => entry.validator.is_none(),
            None => false,
        };
        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            trace!(method = %key.method, "cache entry expired");
        }
        inner.stats.misses += 1;
        None
    }

    /// Expired copy kept for revalidation, with its validator.
    pub fn stale(&self, key: &CacheKey) -> Option<(Value, Validator)> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let inner = self.lock();
        let entry = inner.entries.peek(key).filter(|e| e.is_expired(now))?;
        let validator = entry.validator.clone()?;
        Some((entry.value.clone(), validator))
    }

    /// Record that a stale entry was confirmed by the server.
    pub fn revalidated(&self, key: &CacheKey) {
        trace!(method = %key.method, "stale cache entry revalidated");
        self.lock().stats.revalidations += 1;
    }

    /// Store a value for `ttl`, keeping at most `method_budget` entries for
    /// the key's method.
    pub fn populate(
        &self,
        key: CacheKey,
        value: Value,
        ttl: Option<Duration>,
        method_budget: Option<usize>,
    ) {
        self.populate_validated(key, value, ttl, method_budget, None);
    }

    /// [`ResponseCache::populate`] keeping the server's validator, so the
    /// entry can be revalidated once it expires.
    pub fn populate_validated(
        &self,
        key: CacheKey,
        value: Value,
        ttl: Option<Duration>,
        method_budget: Option<usize>,
        validator: Option<Validator>,
    ) {
        if !self.config.enabled {
            return;
        }
        let size = value.to_string().len() + key.args.len() + key.method.len();
        if size > self.config.max_bytes {
            trace!(method = %key.method, size, "value larger than cache, not stored");
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let method = key.method.clone();
        let pushed = key.clone();
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
            size,
            validator,
        };

        let mut inner = self.lock();
        // push hands back either the replaced value for the same key or the
        // entry evicted to make room
        if let Some((old_key, old)) = inner.entries.push(key, entry) {
            inner.bytes = inner.bytes.saturating_sub(old.size);
            if old_key != pushed {
                inner.stats.evictions += 1;
            }
        }
        inner.bytes += size;

        while inner.bytes > self.config.max_bytes {
            if !inner.evict_lru() {
                break;
            }
        }

        if let Some(budget) = method_budget {
            let budget = budget.max(1);
            while inner.method_count(&method) > budget {
                match inner.oldest_for_method(&method) {
                    Some(oldest) => {
                        inner.remove(&oldest);
                        inner.stats.evictions += 1;
                    }
                    None => break,
                }
            }
        }
    }

    /// Drop a single entry.
    pub fn invalidate(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            ..inner.stats.clone()
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
