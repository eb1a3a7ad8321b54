//! Timeout supervision for cancellable operations
//!
//! A [`WatchdogHandle`] pairs a child cancellation token with a timer thread.
//! The operation reports liveness through [`WatchdogHandle::notify_progress`],
//! which stores a monotonic timestamp in an atomic. The timer thread sleeps
//! until `last_progress + timeout`; if the timestamp has not moved by then it
//! cancels the token with [`CancelReason::Timeout`].
//!
//! The timer never touches the supervised thread. Cancellation is only
//! observed where the operation calls [`WatchdogHandle::check`].

use crate::cancel::{CancelReason, Cancelled, CancellationToken};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct Shared {
    origin: Instant,
    timeout: Duration,
    /// Nanoseconds since `origin` of the last progress signal
    last_progress: AtomicU64,
    closed: AtomicBool,
    timed_out: AtomicBool,
}

impl Shared {
    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Watchdog factory carrying the default timeout for one kind of operation
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
}

impl Watchdog {
    /// Create a watchdog with the given progress timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The progress timeout handed to each handle
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start supervising an operation under `parent`
    pub fn enter(&self, parent: &CancellationToken) -> WatchdogHandle {
        WatchdogHandle::enter(self.timeout, parent)
    }

    /// Run `op` under a fresh handle and close the handle on every exit path
    ///
    /// If `op` fails while the handle's token is cancelled, the cancellation
    /// is reported instead of the operation's own error, so callers see
    /// `Cancelled { reason: Timeout }` rather than a secondary failure.
    pub fn supervise<T, E, F>(&self, parent: &CancellationToken, op: F) -> Result<T, E>
    where
        F: FnOnce(&WatchdogHandle) -> Result<T, E>,
        E: From<Cancelled>,
    {
        let handle = self.enter(parent);
        let result = op(&handle);
        let cancelled = handle.check();
        handle.close();

        match (result, cancelled) {
            (Ok(value), _) => Ok(value),
            (Err(_), Err(cancelled)) => Err(E::from(cancelled)),
            (Err(err), Ok(())) => Err(err),
        }
    }
}

/// Scoped supervision of one operation
///
/// Created at operation start and closed at its end. Dropping the handle
/// closes it, so early returns and `?` never leave a timer running.
pub struct WatchdogHandle {
    shared: Arc<Shared>,
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Start a timer that cancels a child of `parent` after `timeout` without progress
    pub fn enter(timeout: Duration, parent: &CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            origin: Instant::now(),
            timeout,
            last_progress: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        });
        let token = parent.child();

        let timer_shared = Arc::clone(&shared);
        let timer_token = token.clone();
        let timer = thread::Builder::new()
            .name("quire-watchdog".to_string())
            .spawn(move || run_timer(&timer_shared, &timer_token));

        let timer = match timer {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to spawn watchdog timer; operation runs unsupervised");
                None
            }
        };

        Self {
            shared,
            token,
            timer,
        }
    }

    /// Reset the countdown
    pub fn notify_progress(&self) {
        self.shared
            .last_progress
            .store(self.shared.elapsed_nanos(), Ordering::Release);
    }

    /// The token the supervised operation should poll
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Shorthand for `self.token().check()`
    pub fn check(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// True if this handle's own timer fired
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::Acquire)
    }

    /// The configured timeout
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Stop the timer and wait for its thread to exit
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(timer) = self.timer.take() {
            timer.thread().unpark();
            if timer.join().is_err() {
                warn!("watchdog timer thread panicked");
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: &Shared, token: &CancellationToken) {
    loop {
        if shared.closed.load(Ordering::Acquire) || token.is_cancelled() {
            return;
        }

        let last = Duration::from_nanos(shared.last_progress.load(Ordering::Acquire));
        let deadline = last.saturating_add(shared.timeout);
        let now = shared.origin.elapsed();

        if now >= deadline {
            debug!(timeout_ms = shared.timeout.as_millis() as u64, "watchdog fired");
            shared.timed_out.store(true, Ordering::Release);
            token.cancel_with(CancelReason::Timeout);
            return;
        }

        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spin_until_cancelled(handle: &WatchdogHandle, limit: Duration) -> Result<(), Cancelled> {
        let start = Instant::now();
        while start.elapsed() < limit {
            handle.check()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn test_timeout_cancels_without_progress() {
        let root = CancellationToken::new();
        let handle = WatchdogHandle::enter(Duration::from_millis(50), &root);

        let result = spin_until_cancelled(&handle, Duration::from_secs(5));

        let err = result.unwrap_err();
        assert_eq!(err.reason, CancelReason::Timeout);
        assert!(handle.timed_out());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_progress_prevents_timeout() {
        let root = CancellationToken::new();
        let handle = WatchdogHandle::enter(Duration::from_millis(150), &root);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(600) {
            handle.notify_progress();
            assert!(handle.check().is_ok());
            thread::sleep(Duration::from_millis(10));
        }

        assert!(!handle.timed_out());
        handle.close();
    }

    #[test]
    fn test_close_stops_timer() {
        let root = CancellationToken::new();
        let handle = WatchdogHandle::enter(Duration::from_millis(30), &root);
        let token = handle.token().clone();

        handle.close();
        thread::sleep(Duration::from_millis(100));

        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_drop_stops_timer() {
        let root = CancellationToken::new();
        let token = {
            let handle = WatchdogHandle::enter(Duration::from_millis(30), &root);
            handle.token().clone()
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_nested_inner_times_out_independently() {
        let root = CancellationToken::new();
        let outer = WatchdogHandle::enter(Duration::from_secs(10), &root);
        let inner = WatchdogHandle::enter(Duration::from_millis(40), outer.token());

        let result = spin_until_cancelled(&inner, Duration::from_secs(5));

        assert!(result.unwrap_err().is_timeout());
        assert!(!outer.token().is_cancelled());
        assert!(!outer.timed_out());
    }

    #[test]
    fn test_outer_cancellation_reaches_inner() {
        let root = CancellationToken::new();
        let outer = WatchdogHandle::enter(Duration::from_secs(10), &root);
        let inner = WatchdogHandle::enter(Duration::from_secs(10), outer.token());

        root.cancel_with(CancelReason::SessionReplaced);

        assert_eq!(
            inner.check().unwrap_err().reason,
            CancelReason::SessionReplaced
        );
    }

    #[test]
    fn test_supervise_reports_timeout() {
        let watchdog = Watchdog::new(Duration::from_millis(40));
        let root = CancellationToken::new();

        let result: Result<(), Cancelled> = watchdog.supervise(&root, |handle| {
            spin_until_cancelled(handle, Duration::from_secs(5))
        });

        assert!(result.unwrap_err().is_timeout());
    }

    #[test]
    fn test_supervise_passes_success_through() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let root = CancellationToken::new();

        let result: Result<u32, Cancelled> = watchdog.supervise(&root, |handle| {
            handle.notify_progress();
            Ok(7)
        });

        assert_eq!(result.unwrap(), 7);
    }
}
