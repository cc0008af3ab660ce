//! Rendered output storage.
//!
//! Entries are kept in insertion order. Reads never bump recency, so eviction
//! always starts from the oldest-inserted entry. The store is bounded by an
//! approximate byte budget and a maximum entry age.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::keys::CompositeKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Approximate in-memory footprint of a cached output, in bytes.
pub trait ApproxSize {
    fn approx_size(&self) -> usize;
}

impl ApproxSize for String {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl ApproxSize for Bytes {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

impl ApproxSize for Vec<u8> {
    fn approx_size(&self) -> usize {
        self.len()
    }
}

/// A stored output with its insertion instant and approximate size.
#[derive(Debug, Clone)]
pub struct CacheEntry<O> {
    pub output: O,
    pub inserted_at: Instant,
    pub size: usize,
}

impl<O: ApproxSize> CacheEntry<O> {
    pub fn new(output: O) -> Self {
        let size = output.approx_size();
        Self {
            output,
            inserted_at: Instant::now(),
            size,
        }
    }
}

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionCause {
    /// Total size went over the byte budget.
    Capacity,
    /// Older than the maximum age.
    Expired,
    /// A newer entry was stored under the same key.
    Replaced,
    /// The whole store was cleared.
    Cleared,
}

impl EvictionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Expired => "expired",
            Self::Replaced => "replaced",
            Self::Cleared => "cleared",
        }
    }
}

type EvictionListener = Box<dyn Fn(&CompositeKey, EvictionCause) + Send + Sync>;

struct StoreInner<O> {
    entries: LruCache<CompositeKey, CacheEntry<O>>,
    bytes_in_use: usize,
}

fn charge<O>(key: &CompositeKey, entry: &CacheEntry<O>) -> usize {
    entry.size + key.approx_size()
}

pub struct RenderStore<O> {
    max_bytes: usize,
    max_age: Duration,
    inner: RwLock<StoreInner<O>>,
    listeners: RwLock<Vec<EvictionListener>>,
}

impl<O: Clone> RenderStore<O> {
    pub fn new(max_bytes: NonZeroUsize, max_age: Duration) -> Self {
        Self {
            max_bytes: max_bytes.get(),
            max_age,
            inner: RwLock::new(StoreInner {
                entries: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked for every entry that leaves the store.
    ///
    /// Callbacks run after the store lock is released.
    pub fn on_evict<F>(&self, listener: F)
    where
        F: Fn(&CompositeKey, EvictionCause) + Send + Sync + 'static,
    {
        rw_write(&self.listeners, SOURCE, "on_evict").push(Box::new(listener));
    }

    /// Fetch a live entry. Expired entries are reported as absent.
    pub fn get(&self, key: &CompositeKey) -> Option<CacheEntry<O>> {
        let inner = rw_read(&self.inner, SOURCE, "get");
        inner
            .entries
            .peek(key)
            .filter(|entry| !self.is_expired(entry, Instant::now()))
            .cloned()
    }

    pub fn contains(&self, key: &CompositeKey) -> bool {
        let inner = rw_read(&self.inner, SOURCE, "contains");
        inner
            .entries
            .peek(key)
            .is_some_and(|entry| !self.is_expired(entry, Instant::now()))
    }

    /// Insert an entry, then evict from the oldest end while over budget or expired.
    pub fn set(&self, key: CompositeKey, entry: CacheEntry<O>) {
        let mut evicted = Vec::new();
        {
            let mut guard = rw_write(&self.inner, SOURCE, "set");
            let inner = &mut *guard;

            inner.bytes_in_use += charge(&key, &entry);
            if let Some((old_key, old_entry)) = inner.entries.push(key, entry) {
                inner.bytes_in_use = inner
                    .bytes_in_use
                    .saturating_sub(charge(&old_key, &old_entry));
                evicted.push((old_key, EvictionCause::Replaced));
            }

            let now = Instant::now();
            loop {
                let cause = match inner.entries.peek_lru() {
                    Some(_) if inner.bytes_in_use > self.max_bytes => EvictionCause::Capacity,
                    Some((_, oldest)) if self.is_expired(oldest, now) => EvictionCause::Expired,
                    _ => break,
                };
                let Some((old_key, old_entry)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.bytes_in_use = inner
                    .bytes_in_use
                    .saturating_sub(charge(&old_key, &old_entry));
                evicted.push((old_key, cause));
            }
        }
        self.notify(evicted);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut guard = rw_write(&self.inner, SOURCE, "purge_expired");
            let inner = &mut *guard;
            let now = Instant::now();

            // Insertion order means expired entries form a prefix at the oldest end.
            while inner
                .entries
                .peek_lru()
                .is_some_and(|(_, oldest)| self.is_expired(oldest, now))
            {
                let Some((old_key, old_entry)) = inner.entries.pop_lru() else {
                    break;
                };
                inner.bytes_in_use = inner
                    .bytes_in_use
                    .saturating_sub(charge(&old_key, &old_entry));
                evicted.push((old_key, EvictionCause::Expired));
            }
        }
        let purged = evicted.len();
        self.notify(evicted);
        purged
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let evicted: Vec<_> = {
            let mut guard = rw_write(&self.inner, SOURCE, "clear");
            let inner = &mut *guard;
            inner.bytes_in_use = 0;
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some((key, _)) = inner.entries.pop_lru() {
                drained.push((key, EvictionCause::Cleared));
            }
            drained
        };
        let cleared = evicted.len();
        self.notify(evicted);
        cleared
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held, keys included.
    pub fn total_bytes(&self) -> usize {
        rw_read(&self.inner, SOURCE, "total_bytes").bytes_in_use
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn is_expired(&self, entry: &CacheEntry<O>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.max_age
    }

    fn notify(&self, evicted: Vec<(CompositeKey, EvictionCause)>) {
        if evicted.is_empty() {
            return;
        }
        let listeners = rw_read(&self.listeners, SOURCE, "notify");
        for (key, cause) in &evicted {
            counter!("render_cache_evictions_total", "cause" => cause.as_str()).increment(1);
            for listener in listeners.iter() {
                listener(key, *cause);
            }
        }
    }
}
