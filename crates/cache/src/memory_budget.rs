//! Memory tracking for bitmap memory
//!
//! Resident bytes (cached and pooled bitmaps) are sampled by the cache after
//! every mutation; in-flight bytes (render targets being painted) are added
//! and removed by the render pipeline. The sum is compared against warning
//! and critical thresholds and published on a watch channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Memory level of the bitmap subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryLevel {
    Normal,
    /// Warning threshold crossed
    Warning,
    /// Critical threshold crossed
    Critical,
}

impl MemoryLevel {
    /// Classify `used` bytes against the thresholds of `config`
    pub fn classify(used: usize, config: &MemoryTrackerConfig) -> Self {
        if used >= config.critical_bytes() {
            MemoryLevel::Critical
        } else if used >= config.warning_bytes() {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// True for Warning and Critical
    pub fn is_elevated(self) -> bool {
        self != MemoryLevel::Normal
    }
}

/// Thresholds for the memory tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryTrackerConfig {
    /// Total bytes the bitmap subsystem may use
    pub total_budget: usize,
    /// Fraction of the budget at which the level becomes Warning
    pub warning_threshold: f64,
    /// Fraction of the budget at which the level becomes Critical
    pub critical_threshold: f64,
}

impl Default for MemoryTrackerConfig {
    fn default() -> Self {
        Self {
            // 256 MB cache + 64 MB pool + headroom for in-flight renders
            total_budget: 512 * 1024 * 1024,
            warning_threshold: 0.85,
            critical_threshold: 0.95,
        }
    }
}

impl MemoryTrackerConfig {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            ..Default::default()
        }
    }

    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_critical_threshold(mut self, threshold: f64) -> Self {
        self.critical_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn warning_bytes(&self) -> usize {
        (self.total_budget as f64 * self.warning_threshold) as usize
    }

    pub fn critical_bytes(&self) -> usize {
        (self.total_budget as f64 * self.critical_threshold) as usize
    }
}

/// Snapshot published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub resident_bytes: usize,
    pub in_flight_bytes: usize,
    pub peak_bytes: usize,
    /// Used bytes at which the level becomes Warning
    pub warning_bytes: usize,
    /// Used bytes at which the level becomes Critical
    pub critical_bytes: usize,
    pub level: MemoryLevel,
}

impl MemoryStats {
    pub fn used_bytes(&self) -> usize {
        self.resident_bytes + self.in_flight_bytes
    }
}

/// Tracks bitmap memory and publishes [`MemoryStats`]
///
/// # Example
///
/// ```
/// use quire_cache::{MemoryLevel, MemoryTracker, MemoryTrackerConfig};
///
/// let tracker = MemoryTracker::new(MemoryTrackerConfig::new(1000));
/// assert_eq!(tracker.sample_resident(500), MemoryLevel::Normal);
/// assert_eq!(tracker.begin_allocation(400), MemoryLevel::Warning);
/// tracker.end_allocation(400);
/// assert_eq!(tracker.level(), MemoryLevel::Normal);
/// ```
#[derive(Debug)]
pub struct MemoryTracker {
    config: MemoryTrackerConfig,
    resident: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    stats_tx: watch::Sender<MemoryStats>,
}

impl MemoryTracker {
    pub fn new(config: MemoryTrackerConfig) -> Self {
        let (stats_tx, _) = watch::channel(MemoryStats {
            resident_bytes: 0,
            in_flight_bytes: 0,
            peak_bytes: 0,
            warning_bytes: config.warning_bytes(),
            critical_bytes: config.critical_bytes(),
            level: MemoryLevel::Normal,
        });

        Self {
            config,
            resident: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            stats_tx,
        }
    }

    pub fn config(&self) -> &MemoryTrackerConfig {
        &self.config
    }

    /// Record the bytes currently held by caches and pools
    pub fn sample_resident(&self, bytes: usize) -> MemoryLevel {
        self.resident.store(bytes, Ordering::Relaxed);
        self.publish()
    }

    /// Record a transient allocation, such as a render target
    pub fn begin_allocation(&self, bytes: usize) -> MemoryLevel {
        self.in_flight.fetch_add(bytes, Ordering::Relaxed);
        self.publish()
    }

    /// Undo [`begin_allocation`](Self::begin_allocation)
    pub fn end_allocation(&self, bytes: usize) -> MemoryLevel {
        // Saturating, so a mismatched release cannot wrap
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
        self.publish()
    }

    pub fn used_bytes(&self) -> usize {
        self.resident.load(Ordering::Relaxed) + self.in_flight.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> MemoryLevel {
        MemoryLevel::classify(self.used_bytes(), &self.config)
    }

    pub fn stats(&self) -> MemoryStats {
        let resident_bytes = self.resident.load(Ordering::Relaxed);
        let in_flight_bytes = self.in_flight.load(Ordering::Relaxed);
        MemoryStats {
            resident_bytes,
            in_flight_bytes,
            peak_bytes: self.peak_bytes(),
            warning_bytes: self.config.warning_bytes(),
            critical_bytes: self.config.critical_bytes(),
            level: MemoryLevel::classify(resident_bytes + in_flight_bytes, &self.config),
        }
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<MemoryStats> {
        self.stats_tx.subscribe()
    }

    /// Forget the peak, e.g. when a new document is opened
    pub fn reset_peak(&self) {
        self.peak.store(self.used_bytes(), Ordering::Relaxed);
    }

    fn publish(&self) -> MemoryLevel {
        let used = self.used_bytes();
        self.peak.fetch_max(used, Ordering::Relaxed);

        let stats = self.stats();
        self.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
        stats.level
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(MemoryTrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let config = MemoryTrackerConfig::new(1000);
        assert_eq!(MemoryLevel::classify(0, &config), MemoryLevel::Normal);
        assert_eq!(MemoryLevel::classify(849, &config), MemoryLevel::Normal);
        assert_eq!(MemoryLevel::classify(850, &config), MemoryLevel::Warning);
        assert_eq!(MemoryLevel::classify(950, &config), MemoryLevel::Critical);
        assert_eq!(MemoryLevel::classify(5000, &config), MemoryLevel::Critical);
    }

    #[test]
    fn test_threshold_builders_clamp() {
        let config = MemoryTrackerConfig::new(100)
            .with_warning_threshold(1.5)
            .with_critical_threshold(-1.0);
        assert_eq!(config.warning_threshold, 1.0);
        assert_eq!(config.critical_threshold, 0.0);
    }

    #[test]
    fn test_resident_and_in_flight_add_up() {
        let tracker = MemoryTracker::new(MemoryTrackerConfig::new(1000));
        tracker.sample_resident(300);
        tracker.begin_allocation(200);

        assert_eq!(tracker.used_bytes(), 500);
        tracker.end_allocation(200);
        assert_eq!(tracker.used_bytes(), 300);
    }

    #[test]
    fn test_end_allocation_saturates() {
        let tracker = MemoryTracker::new(MemoryTrackerConfig::new(1000));
        tracker.begin_allocation(10);
        tracker.end_allocation(50);
        assert_eq!(tracker.stats().in_flight_bytes, 0);
    }

    #[test]
    fn test_peak_tracking() {
        let tracker = MemoryTracker::new(MemoryTrackerConfig::new(1000));
        tracker.sample_resident(700);
        tracker.sample_resident(100);

        assert_eq!(tracker.peak_bytes(), 700);
        tracker.reset_peak();
        assert_eq!(tracker.peak_bytes(), 100);
    }

    #[test]
    fn test_subscribers_see_level_changes() {
        let tracker = MemoryTracker::new(MemoryTrackerConfig::new(1000));
        let mut rx = tracker.subscribe();

        tracker.sample_resident(960);

        assert!(rx.has_changed().unwrap());
        let stats = *rx.borrow_and_update();
        assert_eq!(stats.level, MemoryLevel::Critical);
        assert_eq!(stats.peak_bytes, 960);
        assert_eq!(stats.warning_bytes, 850);
        assert_eq!(stats.critical_bytes, 950);
    }
}
