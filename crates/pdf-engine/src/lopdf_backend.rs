//! Default engine built on `lopdf`
//!
//! Reads document structure (page tree, MediaBox, outline) and paints each
//! page as blank paper with a grey edge. Pages whose content streams cannot
//! be resolved are reported as malformed.

use crate::outline::{extract_outline, OutlineItem};
use crate::{
    DocumentHandle, EngineCapabilities, OpenSource, PageSize, PaintControl, PaintRequest,
    PdfEngine, PdfEngineError,
};
use lopdf::{Document, Object, ObjectId};
use parking_lot::Mutex;
use quire_cache::Bitmap;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const BAND_ROWS: u32 = 64;
const PAPER: [u8; 4] = [255, 255, 255, 255];
const EDGE: [u8; 4] = [220, 220, 220, 255];
const MAX_PARENT_DEPTH: usize = 64;

struct DocumentRecord {
    document: Document,
    pages: Vec<ObjectId>,
    page_sizes: Vec<PageSize>,
}

impl DocumentRecord {
    fn page(&self, page_index: u32) -> Result<(ObjectId, PageSize), PdfEngineError> {
        let index = page_index as usize;
        match (self.pages.get(index), self.page_sizes.get(index)) {
            (Some(&id), Some(&size)) => Ok((id, size)),
            _ => Err(PdfEngineError::PageOutOfRange {
                page: page_index,
                page_count: self.pages.len() as u32,
            }),
        }
    }
}

#[derive(Default)]
pub struct LopdfEngine {
    next_handle: AtomicU64,
    docs: Mutex<HashMap<DocumentHandle, Arc<DocumentRecord>>>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(bytes: &[u8]) -> Result<DocumentRecord, PdfEngineError> {
        let document = Document::load_mem(bytes)?;
        if document.trailer.get(b"Encrypt").is_ok() {
            return Err(PdfEngineError::EncryptedUnsupported);
        }

        let pages: Vec<ObjectId> = document.get_pages().into_values().collect();
        if pages.is_empty() {
            return Err(PdfEngineError::Backend("document has no pages".to_owned()));
        }

        let page_sizes = pages.iter().map(|&id| page_size(&document, id)).collect();
        Ok(DocumentRecord {
            document,
            pages,
            page_sizes,
        })
    }

    fn record(&self, handle: DocumentHandle) -> Result<Arc<DocumentRecord>, PdfEngineError> {
        self.docs
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

impl PdfEngine for LopdfEngine {
    fn open(&self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let record = Self::load(&bytes)?;
        let handle = DocumentHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(handle = handle.raw(), pages = record.pages.len(), "opened document");
        self.docs.lock().insert(handle, Arc::new(record));

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        Ok(self.record(handle)?.pages.len() as u32)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        Ok(self.record(handle)?.page(page_index)?.1)
    }

    fn paint(
        &self,
        handle: DocumentHandle,
        request: &PaintRequest,
        target: &mut Bitmap,
        control: &mut PaintControl<'_>,
    ) -> Result<(), PdfEngineError> {
        let record = self.record(handle)?;
        let (page_id, size) = record.page(request.page_index)?;
        check_contents(&record.document, page_id).map_err(|reason| {
            PdfEngineError::Malformed(format!("page {}: {reason}", request.page_index))
        })?;

        let scale = if request.scale.is_finite() && request.scale > 0.0 {
            request.scale
        } else {
            1.0
        };
        let (origin_x, origin_y) = request.clip.map_or((0.0, 0.0), |clip| (clip.x, clip.y));
        let (width, height) = (target.width(), target.height());

        let mut row = 0;
        while row < height {
            control.check()?;
            let end = row.saturating_add(BAND_ROWS).min(height);
            target.fill_rect(0, row, width, end, PAPER);
            row = end;
            control.report(row as f32 / height as f32);
        }

        // Page edges in target pixels, inclusive
        let left = (-origin_x * scale).round() as i64;
        let top = (-origin_y * scale).round() as i64;
        let right = ((size.width_pt - origin_x) * scale).round() as i64 - 1;
        let bottom = ((size.height_pt - origin_y) * scale).round() as i64 - 1;
        if right - left >= 3 && bottom - top >= 3 {
            draw_frame(target, left, top, right, bottom);
        }

        control.report(1.0);
        Ok(())
    }

    fn close(&self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        self.docs
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            outline: true,
            page_cleanup: false,
            clipped_paint: true,
        }
    }

    fn outline(&self, handle: DocumentHandle) -> Result<Vec<OutlineItem>, PdfEngineError> {
        let record = self.record(handle)?;
        Ok(extract_outline(&record.document, &record.pages))
    }
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Look up a page attribute, following `/Parent` for inheritable keys
pub(crate) fn inherited<'a>(
    document: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<&'a Object> {
    let mut dict = document.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_PARENT_DEPTH {
        if let Ok(value) = dict.get(key) {
            return resolve(document, value);
        }
        let parent = dict.get(b"Parent").ok()?.as_reference().ok()?;
        dict = document.get_dictionary(parent).ok()?;
    }
    None
}

fn page_size(document: &Document, page_id: ObjectId) -> PageSize {
    let size = inherited(document, page_id, b"MediaBox")
        .and_then(|obj| obj.as_array().ok())
        .and_then(|array| {
            if array.len() != 4 {
                return None;
            }
            let mut coords = [0f32; 4];
            for (slot, value) in coords.iter_mut().zip(array) {
                *slot = resolve(document, value)?.as_float().ok()?;
            }
            let [x0, y0, x1, y1] = coords;
            Some(PageSize {
                width_pt: (x1 - x0).abs(),
                height_pt: (y1 - y0).abs(),
            })
        })
        .filter(|size| size.width_pt > 0.0 && size.height_pt > 0.0)
        .unwrap_or(PageSize::LETTER);

    let rotate = inherited(document, page_id, b"Rotate")
        .and_then(|obj| obj.as_i64().ok())
        .unwrap_or(0);
    if rotate.rem_euclid(180) == 90 {
        PageSize {
            width_pt: size.height_pt,
            height_pt: size.width_pt,
        }
    } else {
        size
    }
}

fn check_contents(document: &Document, page_id: ObjectId) -> Result<(), String> {
    let dict = document
        .get_dictionary(page_id)
        .map_err(|err| format!("unreadable page dictionary: {err}"))?;

    let is_stream = |object: &Object| match object {
        Object::Reference(id) => matches!(document.get_object(*id), Ok(Object::Stream(_))),
        Object::Stream(_) => true,
        _ => false,
    };

    match dict.get(b"Contents") {
        // A page without content is blank, not broken
        Err(_) => Ok(()),
        Ok(Object::Array(items)) if items.iter().all(is_stream) => Ok(()),
        Ok(Object::Reference(id)) => match document.get_object(*id) {
            Ok(Object::Stream(_)) => Ok(()),
            Ok(Object::Array(items)) if items.iter().all(is_stream) => Ok(()),
            _ => Err("unresolvable content stream".to_owned()),
        },
        Ok(_) => Err("invalid content stream".to_owned()),
    }
}

/// Clamp the inclusive span `[a, b]` to `[0, limit)` as a half-open range
fn span(a: i64, b: i64, limit: u32) -> Option<(u32, u32)> {
    let start = a.max(0);
    let end = (b + 1).min(limit as i64);
    (start < end).then_some((start as u32, end as u32))
}

fn draw_frame(target: &mut Bitmap, left: i64, top: i64, right: i64, bottom: i64) {
    let (width, height) = (target.width(), target.height());

    if let Some((x0, x1)) = span(left, right, width) {
        for y in [top, bottom] {
            if let Some((y0, y1)) = span(y, y, height) {
                target.fill_rect(x0, y0, x1, y1, EDGE);
            }
        }
    }
    if let Some((y0, y1)) = span(top, bottom, height) {
        for x in [left, right] {
            if let Some((x0, x1)) = span(x, x, width) {
                target.fill_rect(x0, y0, x1, y1, EDGE);
            }
        }
    }
}
