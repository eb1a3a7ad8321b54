//! Cancellation tokens for supervised operations
//!
//! Tokens form a tree: cancelling a parent is observed by every child, while
//! cancelling a child leaves the parent untouched. A linked token has two
//! parents and observes either. The first reason recorded on a token wins,
//! so a timeout that races a caller cancellation reports whichever happened
//! first.

use std::fmt;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

const NOT_CANCELLED: u8 = 0;

/// Why an operation was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The caller asked for cancellation
    Caller,

    /// The watchdog saw no progress inside its timeout window
    Timeout,

    /// The owning session was closed or replaced
    SessionReplaced,
}

impl CancelReason {
    fn encode(self) -> u8 {
        match self {
            CancelReason::Caller => 1,
            CancelReason::Timeout => 2,
            CancelReason::SessionReplaced => 3,
        }
    }

    fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancelReason::Caller),
            2 => Some(CancelReason::Timeout),
            3 => Some(CancelReason::SessionReplaced),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "watchdog timeout"),
            CancelReason::SessionReplaced => write!(f, "session replaced"),
        }
    }
}

/// Error returned by [`CancellationToken::check`] once a token is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled: {reason}")]
pub struct Cancelled {
    pub reason: CancelReason,
}

impl Cancelled {
    /// Returns true if this cancellation came from a watchdog timeout
    pub fn is_timeout(&self) -> bool {
        self.reason == CancelReason::Timeout
    }
}

struct TokenState {
    reason: AtomicU8,
    parents: Vec<CancellationToken>,
}

/// Cancellation token for cooperative cancellation
///
/// Long loops call [`check`](Self::check) at well-defined points and return
/// early with [`Cancelled`]. Clones share the same state.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new root token in the non-cancelled state
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                reason: AtomicU8::new(NOT_CANCELLED),
                parents: Vec::new(),
            }),
        }
    }

    /// Create a child token that observes this token's cancellation
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(TokenState {
                reason: AtomicU8::new(NOT_CANCELLED),
                parents: vec![self.clone()],
            }),
        }
    }

    /// Create a child that observes both this token and `other`
    pub fn linked(&self, other: &CancellationToken) -> Self {
        Self {
            state: Arc::new(TokenState {
                reason: AtomicU8::new(NOT_CANCELLED),
                parents: vec![self.clone(), other.clone()],
            }),
        }
    }

    /// Cancel on behalf of the caller
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Caller);
    }

    /// Cancel with an explicit reason
    ///
    /// Idempotent: only the first reason is kept.
    pub fn cancel_with(&self, reason: CancelReason) {
        let _ = self.state.reason.compare_exchange(
            NOT_CANCELLED,
            reason.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The reason this token (or any ancestor) was cancelled
    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::decode(self.state.reason.load(Ordering::Acquire))
            .or_else(|| self.state.parents.iter().find_map(CancellationToken::reason))
    }

    /// Check if this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Return `Err(Cancelled)` once the token is cancelled
    pub fn check(&self) -> Result<(), Cancelled> {
        match self.reason() {
            Some(reason) => Err(Cancelled { reason }),
            None => Ok(()),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}
