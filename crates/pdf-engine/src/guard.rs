//! Reentrancy detection for non-reentrant native calls
//!
//! Every call into a document handle enters the guard first. A second entry
//! while the first is still inside fails immediately with [`ReentrantCall`];
//! the guard never waits or queues. Serialisation is the job of the render
//! lock, the guard only proves it held.

use std::sync::atomic::{AtomicBool, Ordering};

/// A call overlapped another call on the same handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reentrant call into the native renderer")]
pub struct ReentrantCall;

#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    busy: AtomicBool,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the handle busy until the returned token is dropped
    pub fn enter(&self) -> Result<GuardToken<'_>, ReentrantCall> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| GuardToken { busy: &self.busy })
            .map_err(|_| ReentrantCall)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of exclusive entry; exits the guard on drop
#[derive(Debug)]
pub struct GuardToken<'a> {
    busy: &'a AtomicBool,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_exit() {
        let guard = ReentrancyGuard::new();
        {
            let _token = guard.enter().unwrap();
            assert!(guard.is_busy());
        }
        assert!(!guard.is_busy());
        assert!(guard.enter().is_ok());
    }

    #[test]
    fn test_overlap_is_rejected() {
        let guard = ReentrancyGuard::new();
        let _token = guard.enter().unwrap();

        assert_eq!(guard.enter().unwrap_err(), ReentrantCall);
    }

    #[test]
    fn test_overlap_from_other_thread() {
        let guard = ReentrancyGuard::new();
        let _token = guard.enter().unwrap();

        std::thread::scope(|scope| {
            let result = scope.spawn(|| guard.enter().map(|_| ())).join().unwrap();
            assert_eq!(result, Err(ReentrantCall));
        });
    }
}
