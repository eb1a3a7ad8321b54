//! Quire bitmap caching
//!
//! Memory-bounded storage for rendered page bitmaps:
//!
//! - [`BitmapPool`]: recycles pixel buffers by allocation size
//! - [`RamBitmapCache`]: O(1) LRU bounded by allocation bytes
//! - [`DiskOverflowStore`]: content-addressed PNG files with mtime LRU
//! - [`MemoryTracker`]: resident and in-flight bytes against thresholds
//! - [`FallbackController`]: switches the cache to disk-backed mode under pressure
//! - [`BitmapCache`]: the tiers composed behind one API

pub mod bitmap;
pub mod config;
pub mod disk;
pub mod fallback;
pub mod memory_budget;
pub mod pool;
pub mod ram;
pub mod tiered;

pub use bitmap::{
    required_bytes, AllocationError, Bitmap, GeometryError, PageBitmapKey, PixelFormat,
    QualityProfile,
};
pub use config::{env_override, CacheConfig, ConfigError};
pub use disk::{DiskCacheStats, DiskOverflowStore, DiskStoreError};
pub use fallback::{
    FallbackController, FallbackReason, FallbackSignal, FallbackState, TrimLevel, Transition,
};
pub use memory_budget::{MemoryLevel, MemoryStats, MemoryTracker, MemoryTrackerConfig};
pub use pool::{BitmapPool, PoolStats};
pub use ram::{CacheKey, CacheStats, EvictionCounts, EvictionReason, Evicted, RamBitmapCache};
pub use tiered::{content_hash, BitmapCache, DiskErrorObserver, TieredCacheStats};

/// Errors surfaced by the tiered cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Disk(#[from] DiskStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
