use quire_cache::{AllocationError, CacheError, ConfigError};
use quire_engine::{PdfEngineError, ReentrantCall};
use quire_repair::RepairError;
use quire_watchdog::{CancelReason, Cancelled, InteractiveContext};
use std::fmt;

/// Why a document could not be opened
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Scheme, MIME type or size is not accepted
    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The document could not be opened, even after a repair attempt
    #[error("corrupted document: {0}")]
    Corrupted(String),

    /// The forced page-tree repair itself failed
    #[error("page-tree repair failed: {0}")]
    RepairFailed(#[source] RepairError),

    #[error("open timed out without progress")]
    Timeout,

    #[error("open cancelled: {0}")]
    Cancelled(CancelReason),

    #[error(transparent)]
    InteractiveContext(#[from] InteractiveContext),
}

impl From<Cancelled> for OpenError {
    fn from(cancelled: Cancelled) -> Self {
        if cancelled.is_timeout() {
            Self::Timeout
        } else {
            Self::Cancelled(cancelled.reason)
        }
    }
}

/// Smaller request that fits under the maximum dimension
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSuggestion {
    Width { requested: u32, suggested: u32 },
    Scale { requested: f32, suggested: f32 },
}

impl fmt::Display for SizeSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Width {
                requested,
                suggested,
            } => write!(f, "width {requested}px too large, try {suggested}px"),
            Self::Scale {
                requested,
                suggested,
            } => write!(f, "scale {requested} too large, try {suggested}"),
        }
    }
}

/// Why a page or tile could not be rendered
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{0}")]
    PageTooLarge(SizeSuggestion),

    /// Latched for the rest of the session; the renderer is not called again
    #[error("page {page} is malformed")]
    MalformedPage { page: u32 },

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("render timed out without progress")]
    Timeout,

    #[error("render cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("no document is open")]
    NoSession,

    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },

    #[error(transparent)]
    Reentrant(#[from] ReentrantCall),

    #[error(transparent)]
    InteractiveContext(#[from] InteractiveContext),

    /// A renderer failure that has not (yet) latched the page
    #[error("native renderer failed: {0}")]
    Native(#[source] PdfEngineError),

    #[error(transparent)]
    Cache(CacheError),
}

impl RenderError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPage { .. })
    }

    pub fn suggestion(&self) -> Option<SizeSuggestion> {
        match self {
            Self::PageTooLarge(suggestion) => Some(*suggestion),
            _ => None,
        }
    }
}

impl From<Cancelled> for RenderError {
    fn from(cancelled: Cancelled) -> Self {
        if cancelled.is_timeout() {
            Self::Timeout
        } else {
            Self::Cancelled(cancelled.reason)
        }
    }
}

impl From<AllocationError> for RenderError {
    fn from(err: AllocationError) -> Self {
        Self::OutOfMemory { bytes: err.bytes }
    }
}

impl From<CacheError> for RenderError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Allocation(alloc) => alloc.into(),
            other => Self::Cache(other),
        }
    }
}

/// Failure to assemble the viewer from its configuration
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repair(#[from] RepairError),
    #[error("invalid malformed-page pattern: {0}")]
    Pattern(#[from] regex::Error),
}
