//! PDFium rasterisation behind the `pdfium` feature
//!
//! Structure queries (page tree, sizes, outline) go through the lopdf engine;
//! only painting is handed to the native library.

use crate::{
    DocumentHandle, EngineCapabilities, LopdfEngine, OpenSource, OutlineItem, PageSize,
    PaintControl, PaintRequest, PdfEngine, PdfEngineError,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use quire_cache::Bitmap;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

pub struct PdfiumEngine {
    inner: LopdfEngine,
    sources: Mutex<HashMap<DocumentHandle, Arc<Vec<u8>>>>,
}

impl PdfiumEngine {
    /// Fails if no PDFium library can be found on the system
    pub fn from_system_library() -> Result<Self, PdfEngineError> {
        bind()?;
        Ok(Self {
            inner: LopdfEngine::new(),
            sources: Mutex::new(HashMap::new()),
        })
    }

    fn source(&self, handle: DocumentHandle) -> Result<Arc<Vec<u8>>, PdfEngineError> {
        self.sources
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

fn bind() -> Result<Pdfium, PdfEngineError> {
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|err| PdfEngineError::Backend(format!("failed to bind pdfium system library: {err}")))
}

impl PdfEngine for PdfiumEngine {
    fn open(&self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };
        let handle = self.inner.open(OpenSource::Bytes(bytes.clone()))?;
        self.sources.lock().insert(handle, Arc::new(bytes));
        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        self.inner.page_count(handle)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        self.inner.page_size(handle, page_index)
    }

    fn paint(
        &self,
        handle: DocumentHandle,
        request: &PaintRequest,
        target: &mut Bitmap,
        control: &mut PaintControl<'_>,
    ) -> Result<(), PdfEngineError> {
        let bytes = self.source(handle)?;
        let size = self.inner.page_size(handle, request.page_index)?;
        control.check()?;

        let pdfium = bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&bytes, None)
            .map_err(|err| PdfEngineError::Backend(err.to_string()))?;
        let index = u16::try_from(request.page_index)
            .map_err(|_| PdfEngineError::Unsupported("page index beyond u16"))?;
        let page = document
            .pages()
            .get(index)
            .map_err(|err| PdfEngineError::Malformed(format!("page {index}: {err}")))?;
        control.report(0.1);
        control.check()?;

        // Rasterise the whole page at the requested scale, then cut out the
        // clip; callers size the whole page against their cap
        let full_width = (size.width_pt * request.scale).round().max(1.0) as i32;
        let full_height = (size.height_pt * request.scale).round().max(1.0) as i32;
        let config = PdfRenderConfig::new()
            .set_target_width(full_width)
            .set_target_height(full_height);
        let rendered = page
            .render_with_config(&config)
            .map_err(|err| PdfEngineError::Backend(err.to_string()))?;
        control.check()?;

        let (x, y) = request.clip.map_or((0, 0), |clip| {
            (
                (clip.x * request.scale).round().max(0.0) as u32,
                (clip.y * request.scale).round().max(0.0) as u32,
            )
        });
        target.fill_rgba([255, 255, 255, 255]);
        target.copy_from_rgba(&rendered.as_rgba_bytes(), rendered.width() as u32, x, y);
        control.report(1.0);
        Ok(())
    }

    fn close(&self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        self.sources.lock().remove(&handle);
        self.inner.close(handle)
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            clipped_paint: false,
            ..self.inner.capabilities()
        }
    }

    fn outline(&self, handle: DocumentHandle) -> Result<Vec<OutlineItem>, PdfEngineError> {
        self.inner.outline(handle)
    }
}
