//! In-memory bitmap cache with LRU eviction
//!
//! Recency is kept in an intrusive doubly linked list threaded through a slab
//! of nodes, with a hash index from key to slot. Lookups, promotions,
//! insertions and evictions are all O(1).
//!
//! Eviction reasons are recorded for diagnostics only; every reason releases
//! the bitmap the same way.

use crate::bitmap::{AllocationError, Bitmap, PageBitmapKey};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Key of a cached bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A rendered page
    Page(PageBitmapKey),

    /// An entry registered under a string alias
    Synthetic(u64),
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// The byte budget was exceeded
    SizePressure,

    /// A trim request removed old entries
    Stale,

    /// A new bitmap was stored under the same key
    Replaced,

    /// Explicit removal or clear
    Manual,
}

/// An entry removed from the cache; the caller decides where the bitmap goes
#[derive(Debug)]
pub struct Evicted {
    pub key: CacheKey,
    pub bitmap: Bitmap,
    pub reason: EvictionReason,
}

/// Eviction counts per reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionCounts {
    pub size_pressure: u64,
    pub stale: u64,
    pub replaced: u64,
    pub manual: u64,
}

impl EvictionCounts {
    fn record(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::SizePressure => self.size_pressure += 1,
            EvictionReason::Stale => self.stale += 1,
            EvictionReason::Replaced => self.replaced += 1,
            EvictionReason::Manual => self.manual += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.size_pressure + self.stale + self.replaced + self.manual
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of bitmaps currently cached
    pub entry_count: usize,

    /// Allocation bytes held by cached bitmaps
    pub memory_used: usize,

    /// Current byte budget
    pub memory_limit: usize,

    pub hits: u64,
    pub misses: u64,
    pub evictions: EvictionCounts,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn memory_utilization(&self) -> f64 {
        if self.memory_limit == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_limit as f64
        }
    }
}

struct Node {
    key: CacheKey,
    bitmap: Bitmap,
    bytes: usize,
    /// Toward the most recently used end
    prev: Option<usize>,
    /// Toward the least recently used end
    next: Option<usize>,
}

/// Internal cache state
struct LruState {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    memory_used: usize,
    memory_limit: usize,
    stats: CacheStats,
}

impl LruState {
    fn new(memory_limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            memory_used: 0,
            memory_limit,
            stats: CacheStats::default(),
        }
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn insert(&mut self, key: CacheKey, bitmap: Bitmap) {
        let bytes = bitmap.allocation_bytes();
        let node = Node {
            key,
            bitmap,
            bytes,
            prev: None,
            next: None,
        };

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        self.index.insert(key, slot);
        self.memory_used += bytes;
        self.push_front(slot);
    }

    fn remove_slot(&mut self, slot: usize, reason: EvictionReason) -> Option<Evicted> {
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.index.remove(&node.key);
        self.memory_used -= node.bytes;
        self.stats.evictions.record(reason);

        Some(Evicted {
            key: node.key,
            bitmap: node.bitmap,
            reason,
        })
    }

    fn evict_to(&mut self, target: usize, reason: EvictionReason, out: &mut Vec<Evicted>) {
        while self.memory_used > target {
            let Some(tail) = self.tail else { break };
            match self.remove_slot(tail, reason) {
                Some(evicted) => out.push(evicted),
                None => break,
            }
        }
    }
}

/// Thread-safe LRU cache of bitmaps bounded by allocation bytes
///
/// Evicted bitmaps are handed back to the caller so they can be recycled.
///
/// # Example
///
/// ```
/// use quire_cache::{Bitmap, CacheKey, PageBitmapKey, PixelFormat, QualityProfile, RamBitmapCache};
///
/// let cache = RamBitmapCache::new(1024 * 1024);
/// let key = CacheKey::Page(PageBitmapKey::new(0, 64, QualityProfile::Balanced));
/// let bitmap = Bitmap::try_new(64, 80, PixelFormat::Rgba8888).unwrap();
///
/// assert!(cache.put(key, bitmap).is_empty());
/// assert!(cache.get(&key).unwrap().is_some());
/// ```
pub struct RamBitmapCache {
    state: Mutex<LruState>,
}

impl RamBitmapCache {
    /// Create a cache bounded to `memory_limit` bytes
    pub fn new(memory_limit: usize) -> Self {
        Self {
            state: Mutex::new(LruState::new(memory_limit)),
        }
    }

    /// Copy of the cached bitmap, promoting the entry to most recently used
    pub fn get(&self, key: &CacheKey) -> Result<Option<Bitmap>, AllocationError> {
        let mut state = self.state.lock();
        let Some(&slot) = state.index.get(key) else {
            state.stats.misses += 1;
            return Ok(None);
        };

        state.touch(slot);
        state.stats.hits += 1;
        match state.node(slot) {
            Some(node) => node.bitmap.try_copy().map(Some),
            None => Ok(None),
        }
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().index.contains_key(key)
    }

    /// Insert a bitmap and return everything that had to leave
    ///
    /// An existing entry under the same key is returned as `Replaced`. Entries
    /// are then evicted from the cold end until the budget holds again, which
    /// can include the new entry itself if it alone exceeds the budget.
    pub fn put(&self, key: CacheKey, bitmap: Bitmap) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();

        if let Some(&slot) = state.index.get(&key) {
            evicted.extend(state.remove_slot(slot, EvictionReason::Replaced));
        }

        state.insert(key, bitmap);
        let limit = state.memory_limit;
        state.evict_to(limit, EvictionReason::SizePressure, &mut evicted);
        evicted
    }

    /// Remove one entry
    pub fn remove(&self, key: &CacheKey) -> Option<Evicted> {
        let mut state = self.state.lock();
        let slot = *state.index.get(key)?;
        state.remove_slot(slot, EvictionReason::Manual)
    }

    /// Evict cold entries until at most `fraction` of the budget is used
    pub fn trim_to_fraction(&self, fraction: f64) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();
        let target = (state.memory_limit as f64 * fraction.clamp(0.0, 1.0)) as usize;
        state.evict_to(target, EvictionReason::Stale, &mut evicted);
        evicted
    }

    /// Change the budget, evicting as needed
    pub fn set_memory_limit(&self, limit: usize) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();
        state.memory_limit = limit;
        state.evict_to(limit, EvictionReason::SizePressure, &mut evicted);
        evicted
    }

    /// Remove every entry
    pub fn clear(&self) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();
        state.evict_to(0, EvictionReason::Manual, &mut evicted);
        // Zero-byte bitmaps survive evict_to(0)
        while let Some(tail) = state.tail {
            match state.remove_slot(tail, EvictionReason::Manual) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        state.slots.clear();
        state.free.clear();
        evicted
    }

    /// Visit entries from most to least recently used without changing recency
    ///
    /// The cache lock is held for the duration of the walk.
    pub fn for_each(&self, mut visit: impl FnMut(&CacheKey, &Bitmap)) {
        let state = self.state.lock();
        let mut cursor = state.head;
        while let Some(slot) = cursor {
            let Some(node) = state.node(slot) else { break };
            visit(&node.key, &node.bitmap);
            cursor = node.next;
        }
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        self.for_each(|key, _| keys.push(*key));
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_used(&self) -> usize {
        self.state.lock().memory_used
    }

    pub fn memory_limit(&self) -> usize {
        self.state.lock().memory_limit
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entry_count: state.index.len(),
            memory_used: state.memory_used,
            memory_limit: state.memory_limit,
            ..state.stats
        }
    }
}
