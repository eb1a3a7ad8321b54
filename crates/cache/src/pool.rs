//! Reusable bitmap buffers
//!
//! Released bitmaps are bucketed by allocation size. `acquire` takes the
//! smallest retained buffer that can hold the request, reconfigures it and
//! zero-fills it, so callers never see pixels from a previous render.

use crate::bitmap::{required_bytes, Bitmap, PixelFormat};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

/// Statistics about pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of buffers currently retained
    pub retained_buffers: usize,

    /// Bytes held by retained buffers
    pub retained_bytes: usize,

    /// Maximum bytes the pool may retain
    pub max_bytes: usize,

    /// Acquisitions served from a retained buffer
    pub hits: u64,

    /// Acquisitions that found no suitable buffer
    pub misses: u64,

    /// Releases the pool refused
    pub rejected: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PoolState {
    /// Allocation size -> buffers of exactly that size
    buckets: BTreeMap<usize, Vec<Bitmap>>,
    retained_bytes: usize,
    stats: PoolStats,
}

/// Bounded pool of mutable pixel buffers
pub struct BitmapPool {
    state: Mutex<PoolState>,
    max_bytes: usize,
    formats: Vec<PixelFormat>,
}

impl BitmapPool {
    /// Pool accepting every pixel format
    pub fn new(max_bytes: usize) -> Self {
        Self::with_formats(max_bytes, &PixelFormat::ALL)
    }

    /// Pool that only recycles the listed formats
    pub fn with_formats(max_bytes: usize, formats: &[PixelFormat]) -> Self {
        Self {
            state: Mutex::new(PoolState {
                buckets: BTreeMap::new(),
                retained_bytes: 0,
                stats: PoolStats {
                    max_bytes,
                    ..Default::default()
                },
            }),
            max_bytes,
            formats: formats.to_vec(),
        }
    }

    pub fn supports(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Take a zero-filled buffer able to hold `width x height` pixels of `format`
    ///
    /// Returns `None` when nothing suitable is retained; the caller allocates.
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Option<Bitmap> {
        let needed = required_bytes(width, height, format)?;
        let mut state = self.state.lock();

        if !self.supports(format) || needed == 0 {
            state.stats.misses += 1;
            return None;
        }

        let size = state
            .buckets
            .range(needed..)
            .find(|(_, buffers)| !buffers.is_empty())
            .map(|(&size, _)| size);

        let Some(size) = size else {
            state.stats.misses += 1;
            return None;
        };

        let bucket = state.buckets.get_mut(&size)?;
        let mut bitmap = bucket.pop()?;
        if bucket.is_empty() {
            state.buckets.remove(&size);
        }

        state.retained_bytes -= bitmap.allocation_bytes();
        state.stats.hits += 1;
        drop(state);

        // Capacity was checked by the bucket lookup
        let reconfigured = bitmap.reconfigure(width, height, format);
        debug_assert!(reconfigured);
        bitmap.zero_fill();

        trace!(width, height, allocation = size, "pool hit");
        Some(bitmap)
    }

    /// Offer a buffer back to the pool
    ///
    /// Immutable buffers, unsupported formats and buffers that would push the
    /// pool over its byte budget are dropped. Returns whether it was retained.
    pub fn release(&self, bitmap: Bitmap) -> bool {
        let bytes = bitmap.allocation_bytes();
        let mut state = self.state.lock();

        let accepted = bitmap.is_mutable()
            && self.supports(bitmap.format())
            && bytes > 0
            && state.retained_bytes + bytes <= self.max_bytes;

        if !accepted {
            state.stats.rejected += 1;
            return false;
        }

        state.retained_bytes += bytes;
        state.buckets.entry(bytes).or_default().push(bitmap);
        true
    }

    /// Drop retained buffers, largest first, until at most `fraction` of the budget is held
    pub fn trim_to_fraction(&self, fraction: f64) {
        let target = (self.max_bytes as f64 * fraction.clamp(0.0, 1.0)) as usize;
        let mut state = self.state.lock();

        while state.retained_bytes > target {
            let Some(mut entry) = state.buckets.last_entry() else {
                break;
            };
            let dropped = entry.get_mut().pop();
            if entry.get().is_empty() {
                entry.remove();
            }
            match dropped {
                Some(bitmap) => state.retained_bytes -= bitmap.allocation_bytes(),
                None => continue,
            }
        }
    }

    /// Drop every retained buffer
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.retained_bytes = 0;
    }

    pub fn retained_bytes(&self) -> usize {
        self.state.lock().retained_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            retained_buffers: state.buckets.values().map(Vec::len).sum(),
            retained_bytes: state.retained_bytes,
            ..state.stats
        }
    }
}
