//! In-memory caches.
//!
//! - [`TtlCache`] remembers lookups (redirect URLs, file sizes) for a
//!   bounded amount of time.
//! - [`FileCache`] keeps small file bodies fetched from remote backends,
//!   bounded by their total size.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::time::Instant;

use crate::task::TaskGroup;

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

/// A cache with per-entry expiry.
///
/// Expired entries are dropped lazily on access and periodically by
/// [`TtlCache::spawn_pruner`]. If a capacity is given, the least recently
/// used entry is evicted first.
pub struct TtlCache<K: Hash + Eq + Clone, V: Clone> {
    entries: Mutex<LruCache<K, TtlEntry<V>>>,
    default_ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: Option<usize>, default_ttl: Duration) -> Self {
        let entries = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            entries: Mutex::new(entries),
            default_ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.lock().put(key, TtlEntry { value, expires_at });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all expired entries, returning how many were dropped.
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();

        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired.len();
        for key in expired {
            entries.pop(&key);
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, TtlEntry<V>>> {
        // A panic while holding the lock cannot leave an entry half-written
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Prunes the cache every `default_ttl` until the group shuts down.
    pub fn spawn_pruner(self: &Arc<Self>, group: &TaskGroup) {
        let cache = Arc::downgrade(self);
        group.schedule_repeat(self.default_ttl, move || {
            let cache = cache.clone();
            async move {
                if let Some(cache) = cache.upgrade() {
                    let pruned = cache.prune();
                    if pruned > 0 {
                        tracing::trace!("Pruned {} expired cache entries", pruned);
                    }
                }
            }
        });
    }
}

struct FileEntry {
    data: Bytes,
    last_access: Instant,
}

struct FileCacheInner {
    entries: LruCache<String, FileEntry>,
    size: u64,
}

/// A size-bounded cache of file bodies keyed by hash.
pub struct FileCache {
    inner: Mutex<FileCacheInner>,
    max_size: u64,
    idle: Duration,
}

impl FileCache {
    pub fn new(max_size: u64, idle: Duration) -> Self {
        Self {
            inner: Mutex::new(FileCacheInner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
            max_size,
            idle,
        }
    }

    pub fn get(&self, hash: &str) -> Option<Bytes> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();

        let idle = match inner.entries.get_mut(hash) {
            Some(entry) if now.duration_since(entry.last_access) <= self.idle => {
                entry.last_access = now;
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if idle {
            if let Some(entry) = inner.entries.pop(hash) {
                inner.size -= entry.data.len() as u64;
            }
        }
        None
    }

    pub fn put(&self, hash: String, data: Bytes) {
        let len = data.len() as u64;
        if len > self.max_size {
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(old) = inner.entries.pop(&hash) {
            inner.size -= old.data.len() as u64;
        }

        while inner.size + len > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.size -= evicted.data.len() as u64,
                None => break,
            }
        }

        inner.size += len;
        inner.entries.put(
            hash,
            FileEntry {
                data,
                last_access: Instant::now(),
            },
        );
    }

    /// Drops entries that have not been accessed for the idle period.
    pub fn prune(&self) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        let mut pruned = 0;

        // Least recently used entries are the oldest
        while let Some((_, entry)) = inner.entries.peek_lru() {
            if now.duration_since(entry.last_access) <= self.idle {
                break;
            }
            if let Some((_, entry)) = inner.entries.pop_lru() {
                inner.size -= entry.data.len() as u64;
                pruned += 1;
            }
        }

        pruned
    }

    /// Returns the total size of cached bodies.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prunes the cache once a minute until the group shuts down.
    pub fn spawn_pruner(self: &Arc<Self>, group: &TaskGroup) {
        let cache = Arc::downgrade(self);
        group.schedule_repeat(Duration::from_secs(60), move || {
            let cache = cache.clone();
            async move {
                if let Some(cache) = cache.upgrade() {
                    cache.prune();
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileCacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
