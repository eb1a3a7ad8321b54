//! Tiered bitmap cache
//!
//! Composes the in-memory LRU, the buffer pool, the disk overflow store and
//! the fallback controller:
//!
//! - evicted bitmaps go back to the pool
//! - while the fallback is active every put is also written to disk and the
//!   memory budget is divided by the configured divisor
//! - memory misses are served from disk when the store has the entry
//! - string aliases map to synthetic memory keys and are dropped with them
//!
//! Disk entries are addressed by a SHA-256 over the current scope (the open
//! document's identity) and the entry descriptor, so bitmaps of different
//! documents never collide in the shared store.

use crate::bitmap::{Bitmap, PageBitmapKey};
use crate::config::CacheConfig;
use crate::disk::{DiskCacheStats, DiskOverflowStore, DiskStoreError};
use crate::fallback::{FallbackController, FallbackSignal, TrimLevel, Transition};
use crate::memory_budget::{MemoryStats, MemoryTracker};
use crate::pool::{BitmapPool, PoolStats};
use crate::ram::{CacheKey, CacheStats, Evicted, EvictionReason, RamBitmapCache};
use crate::CacheError;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback told about disk failures the cache degraded around
pub type DiskErrorObserver = Arc<dyn Fn(&'static str, &DiskStoreError) + Send + Sync>;

/// Aggregated statistics across all tiers
#[derive(Debug, Clone, Copy)]
pub struct TieredCacheStats {
    pub memory: CacheStats,
    pub pool: PoolStats,
    pub disk: Option<DiskCacheStats>,
    pub tracker: MemoryStats,
    pub fallback_active: bool,
    pub aliases: usize,
}

#[derive(Default)]
struct AliasTable {
    by_name: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    next_id: u64,
}

impl AliasTable {
    fn id_for(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        id
    }

    fn forget_id(&mut self, id: u64) {
        if let Some(name) = self.by_id.remove(&id) {
            self.by_name.remove(&name);
        }
    }

    fn clear(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
    }
}

/// SHA-256 hex over `scope` and `descriptor`
pub fn content_hash(scope: &str, descriptor: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(descriptor.as_bytes());
    hex::encode(hasher.finalize())
}

fn page_descriptor(key: &PageBitmapKey) -> String {
    format!(
        "page:{}:{}:{}",
        key.page_index,
        key.target_width,
        key.quality.as_str()
    )
}

fn named_descriptor(name: &str) -> String {
    format!("name:{name}")
}

/// Bitmap cache spanning memory, pool and disk
pub struct BitmapCache {
    ram: RamBitmapCache,
    pool: Arc<BitmapPool>,
    disk: Option<DiskOverflowStore>,
    fallback: FallbackController,
    /// Held while a transition and its budget change are applied
    transition: Mutex<()>,
    tracker: Arc<MemoryTracker>,
    aliases: Mutex<AliasTable>,
    scope: RwLock<String>,
    base_limit: AtomicUsize,
    fallback_divisor: usize,
    observer: RwLock<Option<DiskErrorObserver>>,
}

impl BitmapCache {
    pub fn new(
        memory_limit: usize,
        pool: Arc<BitmapPool>,
        disk: Option<DiskOverflowStore>,
        tracker: Arc<MemoryTracker>,
        fallback_divisor: usize,
    ) -> Self {
        Self {
            ram: RamBitmapCache::new(memory_limit),
            pool,
            disk,
            fallback: FallbackController::new(),
            transition: Mutex::new(()),
            tracker,
            aliases: Mutex::new(AliasTable::default()),
            scope: RwLock::new(String::new()),
            base_limit: AtomicUsize::new(memory_limit),
            fallback_divisor: fallback_divisor.max(1),
            observer: RwLock::new(None),
        }
    }

    /// Build all tiers from configuration
    ///
    /// A disk store that cannot be opened is logged and left out; the cache
    /// then runs memory-only.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let disk = if config.disk_enabled {
            match DiskOverflowStore::open(config.bitmap_dir(), config.disk_cache_bytes()) {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!(dir = %config.bitmap_dir().display(), error = %err, "disk overflow store unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self::new(
            config.ram_cache_bytes(),
            Arc::new(BitmapPool::new(config.pool_bytes())),
            disk,
            Arc::new(MemoryTracker::new(config.tracker_config())),
            config.fallback_divisor,
        ))
    }

    /// Namespace for disk entries, normally the open document's identity
    pub fn set_scope(&self, scope: &str) {
        *self.scope.write() = scope.to_string();
    }

    pub fn scope(&self) -> String {
        self.scope.read().clone()
    }

    pub fn set_disk_error_observer(&self, observer: DiskErrorObserver) {
        *self.observer.write() = Some(observer);
    }

    /// Look up a page bitmap; the result is the caller's own copy
    pub fn get(&self, key: &PageBitmapKey) -> Result<Option<Bitmap>, CacheError> {
        let cache_key = CacheKey::Page(*key);
        if let Some(bitmap) = self.memory_get(&cache_key)? {
            return Ok(Some(bitmap));
        }

        match self.disk_get(&page_descriptor(key)) {
            Some(bitmap) => {
                self.promote(cache_key, &bitmap)?;
                Ok(Some(bitmap))
            }
            None => Ok(None),
        }
    }

    /// Store a page bitmap; the cache takes ownership
    pub fn put(&self, key: PageBitmapKey, bitmap: Bitmap) {
        self.write_through(&page_descriptor(&key), &bitmap);
        self.store_in_memory(CacheKey::Page(key), bitmap);
    }

    /// Look up a bitmap stored under a string alias
    pub fn get_named(&self, name: &str) -> Result<Option<Bitmap>, CacheError> {
        let id = self.aliases.lock().by_name.get(name).copied();
        if let Some(id) = id {
            if let Some(bitmap) = self.memory_get(&CacheKey::Synthetic(id))? {
                return Ok(Some(bitmap));
            }
            // Entry left memory without us seeing it
            self.aliases.lock().forget_id(id);
        }

        match self.disk_get(&named_descriptor(name)) {
            Some(bitmap) => {
                if !self.fallback.is_active() {
                    let id = self.aliases.lock().id_for(name);
                    self.promote(CacheKey::Synthetic(id), &bitmap)?;
                }
                Ok(Some(bitmap))
            }
            None => Ok(None),
        }
    }

    /// Store a bitmap under a string alias
    pub fn put_named(&self, name: &str, bitmap: Bitmap) {
        self.write_through(&named_descriptor(name), &bitmap);
        let id = self.aliases.lock().id_for(name);
        self.store_in_memory(CacheKey::Synthetic(id), bitmap);
    }

    /// Whether a page bitmap is held in memory
    pub fn contains(&self, key: &PageBitmapKey) -> bool {
        self.ram.contains(&CacheKey::Page(*key))
    }

    pub fn contains_named(&self, name: &str) -> bool {
        let id = self.aliases.lock().by_name.get(name).copied();
        id.is_some_and(|id| self.ram.contains(&CacheKey::Synthetic(id)))
    }

    /// Evict cold memory entries and pooled buffers down to `fraction` of their budgets
    pub fn trim_to_fraction(&self, fraction: f64) {
        let evicted = self.ram.trim_to_fraction(fraction);
        debug!(evicted = evicted.len(), fraction, "trimmed memory tier");
        self.recycle(evicted, false);
        self.pool.trim_to_fraction(fraction);
        self.sample();
    }

    /// Drop every memory entry and alias; disk entries stay
    pub fn clear(&self) {
        let evicted = self.ram.clear();
        self.recycle(evicted, true);
        self.aliases.lock().clear();
        self.sample();
    }

    /// Feed a fallback signal and apply the resulting transition
    pub fn signal(&self, signal: FallbackSignal) -> Option<Transition> {
        let transition = {
            let _applying = self.transition.lock();
            let transition = self.fallback.signal(signal)?;
            match transition {
                Transition::Activated(_) => self.activate(),
                Transition::Deactivated => self.deactivate(),
            }
            transition
        };
        self.sample();
        Some(transition)
    }

    /// Host trim request: mild levels trim memory by half, severe ones switch to disk
    pub fn on_trim_memory(&self, level: TrimLevel) -> Option<Transition> {
        if level.activates_fallback() {
            self.signal(FallbackSignal::TrimMemory(level))
        } else {
            self.trim_to_fraction(0.5);
            None
        }
    }

    pub fn fallback(&self) -> &FallbackController {
        &self.fallback
    }

    pub fn pool(&self) -> &Arc<BitmapPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    pub fn disk(&self) -> Option<&DiskOverflowStore> {
        self.disk.as_ref()
    }

    /// Current memory budget, reduced while the fallback is active
    pub fn memory_limit(&self) -> usize {
        self.ram.memory_limit()
    }

    pub fn memory_used(&self) -> usize {
        self.ram.memory_used()
    }

    pub fn stats(&self) -> TieredCacheStats {
        TieredCacheStats {
            memory: self.ram.stats(),
            pool: self.pool.stats(),
            disk: self.disk.as_ref().map(DiskOverflowStore::stats),
            tracker: self.tracker.stats(),
            fallback_active: self.fallback.is_active(),
            aliases: self.aliases.lock().by_name.len(),
        }
    }

    fn memory_get(&self, key: &CacheKey) -> Result<Option<Bitmap>, CacheError> {
        match self.ram.get(key) {
            Ok(found) => Ok(found),
            Err(err) => {
                self.signal(FallbackSignal::AllocationFailure);
                Err(err.into())
            }
        }
    }

    fn promote(&self, key: CacheKey, bitmap: &Bitmap) -> Result<(), CacheError> {
        if self.fallback.is_active() {
            return Ok(());
        }
        match bitmap.try_copy() {
            Ok(copy) => {
                self.store_in_memory(key, copy);
                Ok(())
            }
            Err(err) => {
                self.signal(FallbackSignal::AllocationFailure);
                Err(err.into())
            }
        }
    }

    fn disk_hash(&self, descriptor: &str) -> String {
        content_hash(&self.scope.read(), descriptor)
    }

    fn disk_get(&self, descriptor: &str) -> Option<Bitmap> {
        let disk = self.disk.as_ref()?;
        match disk.get(&self.disk_hash(descriptor)) {
            Ok(found) => found,
            Err(err) => {
                self.report_disk_error("read", &err);
                None
            }
        }
    }

    fn write_through(&self, descriptor: &str, bitmap: &Bitmap) {
        if !self.fallback.is_active() {
            return;
        }
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.put(&self.disk_hash(descriptor), bitmap) {
                self.report_disk_error("write", &err);
            }
        }
    }

    fn store_in_memory(&self, key: CacheKey, bitmap: Bitmap) {
        let evicted = self.ram.put(key, bitmap);
        self.recycle(evicted, true);
        self.sample();
    }

    /// Drop aliases of evicted entries and offer their buffers to the pool
    fn recycle(&self, evicted: Vec<Evicted>, to_pool: bool) {
        if evicted.is_empty() {
            return;
        }

        {
            let mut aliases = self.aliases.lock();
            for entry in &evicted {
                if let CacheKey::Synthetic(id) = entry.key {
                    if entry.reason != EvictionReason::Replaced {
                        aliases.forget_id(id);
                    }
                }
            }
        }

        if to_pool {
            for entry in evicted {
                self.pool.release(entry.bitmap);
            }
        }
    }

    fn sample(&self) {
        let resident = self.ram.memory_used() + self.pool.retained_bytes();
        let level = self.tracker.sample_resident(resident);
        if level.is_elevated() && !self.fallback.is_active() {
            self.signal(FallbackSignal::Pressure(level));
        }
    }

    fn activate(&self) {
        if let Some(disk) = &self.disk {
            let scope = self.scope();
            let names = self.aliases.lock().by_id.clone();
            let mut flushed = 0usize;

            self.ram.for_each(|key, bitmap| {
                let descriptor = match key {
                    CacheKey::Page(page) => page_descriptor(page),
                    CacheKey::Synthetic(id) => match names.get(id) {
                        Some(name) => named_descriptor(name),
                        None => return,
                    },
                };
                match disk.put(&content_hash(&scope, &descriptor), bitmap) {
                    Ok(()) => flushed += 1,
                    Err(err) => self.report_disk_error("flush", &err),
                }
            });
            info!(flushed, "flushed memory tier to disk");
        }

        let reduced = self.base_limit.load(Ordering::Relaxed) / self.fallback_divisor;
        let evicted = self.ram.set_memory_limit(reduced);
        // Memory is scarce: evicted buffers are freed, not pooled
        self.recycle(evicted, false);
    }

    fn deactivate(&self) {
        let evicted = self
            .ram
            .set_memory_limit(self.base_limit.load(Ordering::Relaxed));
        self.recycle(evicted, true);
    }

    fn report_disk_error(&self, operation: &'static str, err: &DiskStoreError) {
        warn!(operation, error = %err, "disk overflow store degraded");
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(operation, err);
        }
    }
}
