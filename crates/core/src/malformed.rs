//! Per-page failure tracking
//!
//! A page is latched malformed after `threshold` consecutive qualifying
//! failures, or at once when the renderer's error text matches one of the
//! configured patterns. Latched pages stay latched until the session closes.
//! Out-of-memory, cancellation and caller mistakes never qualify.

use quire_engine::PdfEngineError;
use regex::RegexSet;
use std::collections::{HashMap, HashSet};

/// Classifies renderer errors
#[derive(Debug, Clone)]
pub struct MalformedHeuristic {
    patterns: RegexSet,
}

/// How a renderer failure counts toward latching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Not the page's fault
    Ignored,
    /// Counts toward the threshold
    Counted,
    /// Latches immediately
    Malformed,
}

impl MalformedHeuristic {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn classify(&self, error: &PdfEngineError) -> FailureKind {
        match error {
            PdfEngineError::OutOfMemory(_)
            | PdfEngineError::Cancelled(_)
            | PdfEngineError::Reentrant(_)
            | PdfEngineError::InvalidHandle(_)
            | PdfEngineError::PageOutOfRange { .. } => FailureKind::Ignored,
            PdfEngineError::Malformed(_) | PdfEngineError::Parse(_) => FailureKind::Malformed,
            other => {
                if self.patterns.is_match(&other.to_string()) {
                    FailureKind::Malformed
                } else {
                    FailureKind::Counted
                }
            }
        }
    }
}

/// Latched pages and failure counters of one session
#[derive(Debug)]
pub struct PageHealth {
    threshold: u32,
    failures: HashMap<u32, u32>,
    latched: HashSet<u32>,
}

impl PageHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: HashMap::new(),
            latched: HashSet::new(),
        }
    }

    pub fn is_latched(&self, page_index: u32) -> bool {
        self.latched.contains(&page_index)
    }

    /// Record a failure; returns true if the page is now latched
    pub fn record_failure(&mut self, page_index: u32, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Ignored => return self.is_latched(page_index),
            FailureKind::Malformed => {
                self.failures.remove(&page_index);
                self.latched.insert(page_index);
            }
            FailureKind::Counted => {
                let count = self.failures.entry(page_index).or_insert(0);
                *count += 1;
                if *count >= self.threshold {
                    self.failures.remove(&page_index);
                    self.latched.insert(page_index);
                }
            }
        }
        self.is_latched(page_index)
    }

    pub fn record_success(&mut self, page_index: u32) {
        self.failures.remove(&page_index);
    }

    pub fn failures(&self, page_index: u32) -> u32 {
        self.failures.get(&page_index).copied().unwrap_or(0)
    }

    pub fn latched_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.latched.iter().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn clear(&mut self) {
        self.failures.clear();
        self.latched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_cache::AllocationError;

    fn heuristic() -> MalformedHeuristic {
        MalformedHeuristic::new([r"(?i)corrupt", r"(?i)unresolvable"]).unwrap()
    }

    #[test]
    fn test_classify() {
        let h = heuristic();
        assert_eq!(
            h.classify(&PdfEngineError::Backend("glyph cache busy".into())),
            FailureKind::Counted
        );
        assert_eq!(
            h.classify(&PdfEngineError::Backend("Corrupt content stream".into())),
            FailureKind::Malformed
        );
        assert_eq!(
            h.classify(&PdfEngineError::Malformed("missing /Contents".into())),
            FailureKind::Malformed
        );
        let oom = AllocationError {
            bytes: 1 << 30,
            width: 16384,
            height: 16384,
        };
        assert_eq!(
            h.classify(&PdfEngineError::OutOfMemory(oom)),
            FailureKind::Ignored
        );
    }

    #[test]
    fn test_latch_at_threshold() {
        let mut health = PageHealth::new(2);

        assert!(!health.record_failure(4, FailureKind::Counted));
        assert_eq!(health.failures(4), 1);
        assert!(health.record_failure(4, FailureKind::Counted));
        assert!(health.is_latched(4));
        assert!(!health.is_latched(5));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut health = PageHealth::new(2);

        health.record_failure(1, FailureKind::Counted);
        health.record_success(1);
        assert!(!health.record_failure(1, FailureKind::Counted));
    }

    #[test]
    fn test_heuristic_latches_immediately() {
        let mut health = PageHealth::new(5);

        assert!(health.record_failure(0, FailureKind::Malformed));
        assert_eq!(health.latched_pages(), vec![0]);
    }

    #[test]
    fn test_ignored_failures_never_latch() {
        let mut health = PageHealth::new(1);

        for _ in 0..10 {
            assert!(!health.record_failure(2, FailureKind::Ignored));
        }
        assert_eq!(health.failures(2), 0);
    }

    #[test]
    fn test_clear() {
        let mut health = PageHealth::new(1);
        health.record_failure(3, FailureKind::Counted);

        health.clear();
        assert!(!health.is_latched(3));
        assert!(health.latched_pages().is_empty());
    }
}
