//! Disk fallback state machine
//!
//! Two states: inactive and active. Low-memory signals, severe trim requests,
//! elevated memory levels and allocation failures activate the fallback; only
//! an explicit memory-normal signal deactivates it. The controller only
//! decides transitions. The owning cache applies their effects (flush to
//! disk, shrink, restore).

use crate::memory_budget::MemoryLevel;
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Host trim-memory severity, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrimLevel {
    RunningModerate,
    RunningLow,
    RunningCritical,
    UiHidden,
    Background,
    Moderate,
    Complete,
}

impl TrimLevel {
    /// Trims at or above this level switch to the disk fallback
    pub const FALLBACK_THRESHOLD: TrimLevel = TrimLevel::RunningLow;

    pub fn activates_fallback(self) -> bool {
        self >= Self::FALLBACK_THRESHOLD
    }
}

/// Why the fallback is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    LowMemorySignal,
    TrimMemory(TrimLevel),
    MemoryLevel(MemoryLevel),
    AllocationFailure,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::LowMemorySignal => write!(f, "low-memory signal"),
            FallbackReason::TrimMemory(level) => write!(f, "trim-memory {level:?}"),
            FallbackReason::MemoryLevel(level) => write!(f, "memory level {level:?}"),
            FallbackReason::AllocationFailure => write!(f, "allocation failure"),
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSignal {
    LowMemory,
    TrimMemory(TrimLevel),
    Pressure(MemoryLevel),
    AllocationFailure,
    MemoryNormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Inactive,
    Active(FallbackReason),
}

/// State change produced by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activated(FallbackReason),
    Deactivated,
}

/// Decides when the cache switches to disk-backed mode
///
/// Publishes a `bool` "fallback active" stream for the host.
#[derive(Debug)]
pub struct FallbackController {
    state: Mutex<FallbackState>,
    active_tx: watch::Sender<bool>,
}

impl FallbackController {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(FallbackState::Inactive),
            active_tx,
        }
    }

    /// Feed a signal; returns the transition it caused, if any
    ///
    /// Signals that do not reach their threshold are ignored, as are
    /// activation signals while already active.
    pub fn signal(&self, signal: FallbackSignal) -> Option<Transition> {
        let mut state = self.state.lock();

        let transition = match (*state, signal) {
            (FallbackState::Active(_), FallbackSignal::MemoryNormal) => {
                *state = FallbackState::Inactive;
                Transition::Deactivated
            }
            (FallbackState::Active(_), _) | (FallbackState::Inactive, FallbackSignal::MemoryNormal) => {
                return None;
            }
            (FallbackState::Inactive, signal) => {
                let reason = activation_reason(signal)?;
                *state = FallbackState::Active(reason);
                Transition::Activated(reason)
            }
        };

        self.active_tx
            .send_replace(matches!(transition, Transition::Activated(_)));
        match transition {
            Transition::Activated(reason) => info!(%reason, "disk fallback activated"),
            Transition::Deactivated => info!("disk fallback deactivated"),
        }
        Some(transition)
    }

    pub fn state(&self) -> FallbackState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), FallbackState::Active(_))
    }

    /// Stream of the active flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active_tx.subscribe()
    }
}

impl Default for FallbackController {
    fn default() -> Self {
        Self::new()
    }
}

fn activation_reason(signal: FallbackSignal) -> Option<FallbackReason> {
    match signal {
        FallbackSignal::LowMemory => Some(FallbackReason::LowMemorySignal),
        FallbackSignal::TrimMemory(level) if level.activates_fallback() => {
            Some(FallbackReason::TrimMemory(level))
        }
        FallbackSignal::Pressure(level) if level.is_elevated() => {
            Some(FallbackReason::MemoryLevel(level))
        }
        FallbackSignal::AllocationFailure => Some(FallbackReason::AllocationFailure),
        _ => None,
    }
}
