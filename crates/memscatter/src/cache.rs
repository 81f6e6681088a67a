//! Frame and translation caches.
//!
//! Both caches are sharded LRUs so that concurrent readers touching
//! different frames rarely contend on the same lock.

use crate::paging::{Translation, FRAME_SHIFT, FRAME_SIZE};
use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;
use std::hash::{BuildHasher, Hash, RandomState};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// An LRU split into independently locked shards.
///
/// Capacity is divided evenly between shards, so eviction is only
/// approximately least-recently-used across the whole cache.
pub struct ShardedLru<K, V> {
    shards: Box<[RwLock<LruCache<K, V>>]>,
    hasher: RandomState,
}

impl<K: Hash + Eq, V: Clone> ShardedLru<K, V> {
    /// `capacity` must be non-zero. `shards` is clamped to `1..=capacity`.
    pub fn new(capacity: NonZeroUsize, shards: usize) -> Self {
        let shard_count = shards.clamp(1, capacity.get());
        let per_shard = capacity.get().div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count)
            .map(|_| RwLock::new(LruCache::new(per_shard)))
            .collect();

        ShardedLru {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<LruCache<K, V>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Lookups only take the shard's read lock. Recency is updated when the
    /// write lock happens to be free.
    pub fn get(&self, key: &K) -> Option<V> {
        let shard = self.shard(key);
        let value = shard.read().peek(key).cloned()?;
        if let Some(mut guard) = shard.try_write() {
            guard.promote(key);
        }
        Some(value)
    }

    pub fn put(&self, key: K, value: V) {
        self.shard(&key).write().put(key, value);
    }

    /// Insert only if `admit` still holds once the shard's write lock is held.
    pub fn put_if(&self, key: K, value: V, admit: impl FnOnce() -> bool) -> bool {
        let mut shard = self.shard(&key).write();
        if !admit() {
            return false;
        }
        shard.put(key, value);
        true
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.shard(key).write().pop(key).is_some()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache of complete physical frames keyed by frame number.
///
/// Every frame has a version, bumped by each invalidation that covers it.
/// A frame read from the backend is only admitted if its version is still
/// the one observed before the read, so a fetch racing a write can never
/// reinstate the bytes the write replaced.
///
/// A disabled cache (zero capacity) accepts every call and never hits.
pub struct PageCache {
    frames: Option<ShardedLru<u64, Arc<[u8]>>>,
    versions: Box<[AtomicU64]>,
    resets: AtomicU64,
    counters: Counters,
}

impl PageCache {
    pub fn new(capacity: usize, shards: usize) -> Self {
        PageCache {
            frames: NonZeroUsize::new(capacity).map(|cap| ShardedLru::new(cap, shards)),
            versions: (0..shards.max(1)).map(|_| AtomicU64::new(0)).collect(),
            resets: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn stripe(&self, base: u64) -> &AtomicU64 {
        &self.versions[(base >> FRAME_SHIFT) as usize % self.versions.len()]
    }

    /// Version of the frame at `base`. Take it before reading the frame
    /// from the backend and hand it to [`PageCache::put`].
    ///
    /// Both counters only grow, so the sum changes whenever either does.
    pub fn version(&self, base: u64) -> u64 {
        self.resets.load(Ordering::Acquire) + self.stripe(base).load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.frames.is_some()
    }

    /// Look up the frame at `base` (frame aligned).
    pub fn get(&self, base: u64) -> Option<Arc<[u8]>> {
        let hit = self.frames.as_ref()?.get(&(base >> FRAME_SHIFT));
        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Store a frame read under `version`. Partial frames are never cached,
    /// and neither are frames invalidated since `version` was taken.
    pub fn put(&self, base: u64, data: Arc<[u8]>, version: u64) -> bool {
        if data.len() != FRAME_SIZE {
            return false;
        }
        let Some(frames) = &self.frames else {
            return false;
        };
        let admitted = frames.put_if(base >> FRAME_SHIFT, data, || self.version(base) == version);
        if admitted {
            self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn invalidate(&self, base: u64) {
        // Bump before removing: a racing put either lands first and is
        // removed here, or sees the new version and backs off.
        self.stripe(base).fetch_add(1, Ordering::AcqRel);
        if let Some(frames) = &self.frames {
            if frames.remove(&(base >> FRAME_SHIFT)) {
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.resets.fetch_add(1, Ordering::AcqRel);
        if let Some(frames) = &self.frames {
            frames.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.as_ref().map_or(0, ShardedLru::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

/// Which root of an address space a translation was made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Kernel,
    User,
}

/// Key of a cached translation. The generation ties the entry to one
/// registration of a process, so a re-registered pid never sees stale
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlbKey {
    pub generation: u64,
    pub root: RootKind,
    pub page: u64,
}

/// Page-granular translation cache.
///
/// Entries are tagged with the epoch current at insertion. Any event that
/// may change page tables (an accepted physical write, an invalidation)
/// bumps the epoch, which retires every older entry at once.
pub struct TranslationCache {
    entries: Option<ShardedLru<TlbKey, (u64, Translation)>>,
    epoch: AtomicU64,
    hits: AtomicU64,
}

impl TranslationCache {
    pub fn new(capacity: usize, shards: usize) -> Self {
        TranslationCache {
            entries: NonZeroUsize::new(capacity).map(|cap| ShardedLru::new(cap, shards)),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Retire all current entries.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Translation for the page containing the key's address, if current.
    pub fn get(&self, key: &TlbKey) -> Option<Translation> {
        let (epoch, translation) = self.entries.as_ref()?.get(key)?;
        if epoch != self.epoch() {
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(translation)
    }

    /// Cache `translation` (of the page start) under `epoch`, the epoch
    /// observed before the walk began.
    pub fn put(&self, key: TlbKey, epoch: u64, translation: Translation) {
        if let Some(entries) = &self.entries {
            entries.put(key, (epoch, translation));
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.clear();
        }
        self.bump_epoch();
    }
}
