//! Native page-rendering seam
//!
//! [`PdfEngine`] is the handle-based primitive the viewer core drives:
//! open a document, query page count and sizes, paint a page region into a
//! caller-supplied [`Bitmap`], close. Implementations are not assumed to be
//! reentrant; callers serialise access per handle and verify it with a
//! [`ReentrancyGuard`].
//!
//! Optional features are advertised through [`EngineCapabilities`] instead of
//! being discovered by failing calls.

mod guard;
mod lopdf_backend;
mod outline;

#[cfg(feature = "pdfium")]
pub mod pdfium_backend;

pub use guard::{GuardToken, ReentrancyGuard, ReentrantCall};
pub use lopdf_backend::LopdfEngine;
pub use outline::OutlineItem;

use quire_cache::{AllocationError, Bitmap};
use quire_watchdog::{Cancelled, CancellationToken};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    /// For engine implementations outside this crate
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Page size in PDF points (1/72 inch)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    /// US Letter, used when a page has no usable MediaBox
    pub const LETTER: PageSize = PageSize {
        width_pt: 612.0,
        height_pt: 792.0,
    };
}

/// Region of a page in points, origin at the top-left corner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// What to paint into the target bitmap
///
/// Target pixel `(px, py)` shows page point
/// `(clip.x + px / scale, clip.y + py / scale)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintRequest {
    pub page_index: u32,
    /// Pixels per point
    pub scale: f32,
    /// Page region at the target's origin; `None` means the whole page
    pub clip: Option<ClipRect>,
}

impl PaintRequest {
    pub fn page(page_index: u32, scale: f32) -> Self {
        Self {
            page_index,
            scale,
            clip: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Optional features of an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// `outline` returns the document outline
    pub outline: bool,
    /// `release_page` frees per-page native resources
    pub page_cleanup: bool,
    /// `paint` rasterises only the clip; otherwise the whole page is
    /// rasterised at the request scale and the clip copied out of it
    pub clipped_paint: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("malformed page: {0}")]
    Malformed(String),
    #[error(transparent)]
    OutOfMemory(#[from] AllocationError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error(transparent)]
    Reentrant(#[from] ReentrantCall),
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Cancellation and progress plumbing for one paint call
pub struct PaintControl<'a> {
    token: &'a CancellationToken,
    progress: &'a mut dyn FnMut(f32),
}

impl<'a> PaintControl<'a> {
    pub fn new(token: &'a CancellationToken, progress: &'a mut dyn FnMut(f32)) -> Self {
        Self { token, progress }
    }

    /// Bail out if the operation was cancelled
    pub fn check(&self) -> Result<(), PdfEngineError> {
        Ok(self.token.check()?)
    }

    /// Report progress in `[0, 1]`
    pub fn report(&mut self, fraction: f32) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }
}

/// Handle-based page renderer
pub trait PdfEngine: Send + Sync {
    fn open(&self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError>;

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError>;

    fn page_size(&self, handle: DocumentHandle, page_index: u32)
        -> Result<PageSize, PdfEngineError>;

    /// Paint `request` into `target`, covering every target pixel
    fn paint(
        &self,
        handle: DocumentHandle,
        request: &PaintRequest,
        target: &mut Bitmap,
        control: &mut PaintControl<'_>,
    ) -> Result<(), PdfEngineError>;

    fn close(&self, handle: DocumentHandle) -> Result<(), PdfEngineError>;

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    fn outline(&self, _handle: DocumentHandle) -> Result<Vec<OutlineItem>, PdfEngineError> {
        Err(PdfEngineError::Unsupported("outline extraction"))
    }

    fn release_page(&self, _handle: DocumentHandle, _page_index: u32) -> Result<(), PdfEngineError> {
        Err(PdfEngineError::Unsupported("page cleanup"))
    }
}

pub fn default_engine() -> LopdfEngine {
    LopdfEngine::new()
}
