//! Quire Watchdog Library
//!
//! Cooperative cancellation and timeout supervision for long-running
//! document operations.
//!
//! Every open and render in the viewer core runs under a [`WatchdogHandle`].
//! The handle owns a child [`CancellationToken`]; a dedicated timer thread
//! cancels that token with [`CancelReason::Timeout`] when no progress signal
//! arrives inside the configured window.
//!
//! # Example
//!
//! ```
//! use quire_watchdog::{CancellationToken, Watchdog};
//! use std::time::Duration;
//!
//! let watchdog = Watchdog::new(Duration::from_secs(5));
//! let root = CancellationToken::new();
//!
//! let total: Result<u64, quire_watchdog::Cancelled> = watchdog.supervise(&root, |handle| {
//!     let mut sum = 0;
//!     for chunk in 0..16u64 {
//!         handle.check()?;
//!         sum += chunk;
//!         handle.notify_progress();
//!     }
//!     Ok(sum)
//! });
//!
//! assert_eq!(total.unwrap(), 120);
//! ```

mod cancel;
pub mod context;
mod watchdog;

pub use cancel::{CancelReason, Cancelled, CancellationToken};
pub use context::{ensure_background, InteractiveContext, InteractiveScope};
pub use watchdog::{Watchdog, WatchdogHandle};
