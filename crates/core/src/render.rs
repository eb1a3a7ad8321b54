//! Render pipeline
//!
//! Every render resolves the current session, checks the page is in range
//! and not latched malformed, consults the bitmap cache and only then paints
//! under the session's render lock and a watchdog. Foreground renders wait
//! for the lock; background renders (thumbnails, prefetch) give up and
//! return `None` when it is taken.
//!
//! Paint targets come from the bitmap pool when possible. On failure the
//! target goes back to the pool; on success it moves into the cache and the
//! caller receives a copy.

use crate::config::RenderConfig;
use crate::error::RenderError;
use crate::geometry::{page_height_for_width, plan_page, plan_tile, TileRaster};
use crate::progress::{ProgressPublisher, RenderProgress};
use crate::session::{Session, SessionManager};
use crate::telemetry::{metadata, RenderCost};
use quire_cache::{
    required_bytes, Bitmap, FallbackSignal, PageBitmapKey, PixelFormat, QualityProfile,
};
use quire_engine::{ClipRect, PageSize, PaintControl, PaintRequest, PdfEngineError};
use quire_watchdog::{ensure_background, CancellationToken, Watchdog, WatchdogHandle};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Waits for the render lock and publishes progress
    Foreground,
    /// Skips when the render lock is taken
    Background,
}

/// Pages touched by one [`RenderPipeline::prefetch`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub rendered: Vec<u32>,
    pub cached: Vec<u32>,
    /// Latched pages and pages skipped on lock contention
    pub skipped: Vec<u32>,
    pub failed: Vec<u32>,
}

enum Slot {
    Page(PageBitmapKey),
    Named(String),
}

struct Job {
    kind: &'static str,
    mode: RenderMode,
    slot: Slot,
    request: PaintRequest,
    width: u32,
    height: u32,
    format: PixelFormat,
}

pub struct RenderPipeline {
    sessions: Arc<SessionManager>,
    progress: ProgressPublisher,
}

impl RenderPipeline {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            progress: ProgressPublisher::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<RenderProgress> {
        self.progress.subscribe()
    }

    /// Render a whole page `width` pixels wide, waiting for the render lock
    pub fn render_page(
        &self,
        page_index: u32,
        width: u32,
        quality: QualityProfile,
    ) -> Result<Option<Bitmap>, RenderError> {
        self.render_page_with(page_index, width, quality, RenderMode::Foreground, None)
    }

    pub fn render_page_with(
        &self,
        page_index: u32,
        width: u32,
        quality: QualityProfile,
        mode: RenderMode,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bitmap>, RenderError> {
        ensure_background()?;
        let session = self.session_for(page_index)?;
        let size = page_size(&session, page_index);
        let format = quality.pixel_format();

        let plan = match plan_page(size, width, self.config().max_dimension) {
            Ok(plan) => plan,
            Err(suggestion) => {
                let height = page_height_for_width(size, width.max(1));
                self.record_cost("page", page_index, width, height, format, "too_large");
                return Err(RenderError::PageTooLarge(suggestion));
            }
        };

        let job = Job {
            kind: "page",
            mode,
            slot: Slot::Page(PageBitmapKey::new(page_index, plan.width, quality)),
            request: PaintRequest::page(page_index, plan.scale),
            width: plan.width,
            height: plan.height,
            format,
        };
        self.run(&session, job, cancel)
    }

    /// Render a page region at `scale` pixels per point
    ///
    /// The region is clamped to the page first, so requests partly or wholly
    /// outside the page still produce at least one pixel.
    pub fn render_tile(
        &self,
        page_index: u32,
        rect: ClipRect,
        scale: f32,
        quality: QualityProfile,
    ) -> Result<Option<Bitmap>, RenderError> {
        self.render_tile_with(page_index, rect, scale, quality, RenderMode::Foreground, None)
    }

    pub fn render_tile_with(
        &self,
        page_index: u32,
        rect: ClipRect,
        scale: f32,
        quality: QualityProfile,
        mode: RenderMode,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bitmap>, RenderError> {
        ensure_background()?;
        let session = self.session_for(page_index)?;
        let size = page_size(&session, page_index);
        let format = quality.pixel_format();
        let raster = if session.clipped_paint() {
            TileRaster::Clip
        } else {
            TileRaster::WholePage
        };

        let plan = match plan_tile(size, rect, scale, self.config().max_dimension, raster) {
            Ok(plan) => plan,
            Err(suggestion) => {
                if let Ok(unbounded) = plan_tile(size, rect, scale, u32::MAX, raster) {
                    let (width, height) = (unbounded.width, unbounded.height);
                    self.record_cost("tile", page_index, width, height, format, "too_large");
                }
                return Err(RenderError::PageTooLarge(suggestion));
            }
        };

        let name = format!(
            "tile:{page_index}:{}:{}:{}x{}@{}:{}",
            plan.origin_px.0,
            plan.origin_px.1,
            plan.width,
            plan.height,
            plan.scale,
            quality.as_str()
        );
        let job = Job {
            kind: "tile",
            mode,
            slot: Slot::Named(name),
            request: PaintRequest {
                page_index,
                scale: plan.scale,
                clip: Some(plan.clip),
            },
            width: plan.width,
            height: plan.height,
            format,
        };
        self.run(&session, job, cancel)
    }

    /// Best-effort thumbnail, cached as `thumb:{page}:{width}`
    pub fn render_thumbnail(&self, page_index: u32, width: u32) -> Result<Option<Bitmap>, RenderError> {
        ensure_background()?;
        let session = self.session_for(page_index)?;
        let size = page_size(&session, page_index);
        let quality = self.config().thumbnail_quality;
        let plan = plan_page(size, width, self.config().max_dimension)
            .map_err(RenderError::PageTooLarge)?;

        let job = Job {
            kind: "thumbnail",
            mode: RenderMode::Background,
            slot: Slot::Named(format!("thumb:{page_index}:{}", plan.width)),
            request: PaintRequest::page(page_index, plan.scale),
            width: plan.width,
            height: plan.height,
            format: quality.pixel_format(),
        };
        self.run(&session, job, None)
    }

    /// Render neighbours of `center` in background mode, nearest first
    ///
    /// `radius` defaults to the configured prefetch radius.
    pub fn prefetch(
        &self,
        center: u32,
        radius: Option<u32>,
        width: u32,
        quality: QualityProfile,
    ) -> Result<PrefetchReport, RenderError> {
        ensure_background()?;
        let session = self.sessions.current().ok_or(RenderError::NoSession)?;
        let radius = radius.unwrap_or(self.config().prefetch_radius);
        let mut report = PrefetchReport::default();

        for page_index in prefetch_order(center, radius, session.page_count()) {
            if session.is_latched(page_index) {
                report.skipped.push(page_index);
                continue;
            }
            let key = PageBitmapKey::new(page_index, width.max(1), quality);
            if self.sessions.cache().contains(&key) {
                report.cached.push(page_index);
                continue;
            }

            match self.render_page_with(page_index, width, quality, RenderMode::Background, None) {
                Ok(Some(_)) => report.rendered.push(page_index),
                Ok(None) => report.skipped.push(page_index),
                Err(RenderError::NoSession | RenderError::Cancelled(_)) => break,
                Err(err) => {
                    debug!(page = page_index, %err, "prefetch failed");
                    report.failed.push(page_index);
                }
            }
        }

        debug!(
            center,
            rendered = report.rendered.len(),
            cached = report.cached.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "prefetch finished"
        );
        Ok(report)
    }

    /// Like [`render_page`](Self::render_page), but a malformed page yields a
    /// flat placeholder of the requested geometry instead of an error
    pub fn render_page_or_placeholder(
        &self,
        page_index: u32,
        width: u32,
        quality: QualityProfile,
    ) -> Result<Bitmap, RenderError> {
        match self.render_page(page_index, width, quality) {
            Ok(Some(bitmap)) => Ok(bitmap),
            Ok(None) | Err(RenderError::MalformedPage { .. }) => {
                self.placeholder(page_index, width, quality)
            }
            Err(err) => Err(err),
        }
    }

    fn placeholder(
        &self,
        page_index: u32,
        width: u32,
        quality: QualityProfile,
    ) -> Result<Bitmap, RenderError> {
        let session = self.sessions.current().ok_or(RenderError::NoSession)?;
        let size = page_size(&session, page_index);
        let plan = plan_page(size, width, self.config().max_dimension)
            .map_err(RenderError::PageTooLarge)?;

        let mut bitmap = Bitmap::try_new(plan.width, plan.height, quality.pixel_format())?;
        bitmap.fill_rgba(self.config().placeholder_rgba);
        Ok(bitmap)
    }

    fn config(&self) -> &RenderConfig {
        &self.sessions.config().render
    }

    fn session_for(&self, page_index: u32) -> Result<Arc<Session>, RenderError> {
        let session = self.sessions.current().ok_or(RenderError::NoSession)?;
        if page_index >= session.page_count() {
            return Err(RenderError::PageOutOfRange {
                page: page_index,
                page_count: session.page_count(),
            });
        }
        if session.is_latched(page_index) {
            return Err(RenderError::MalformedPage { page: page_index });
        }
        Ok(session)
    }

    fn run(
        &self,
        session: &Session,
        job: Job,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bitmap>, RenderError> {
        let caller = cancel.cloned().unwrap_or_default();
        let token = session.token().linked(&caller);
        token.check()?;

        if let Some(hit) = self.cached(&job.slot, &token)? {
            trace!(page = job.request.page_index, kind = job.kind, "cache hit");
            return Ok(Some(hit));
        }

        let watchdog = Watchdog::new(self.config().render_timeout());
        let result = watchdog.supervise(&token, |handle| self.paint(session, &job, handle));
        if job.mode == RenderMode::Foreground {
            self.progress.finish();
        }

        let outcome = match &result {
            Ok(Some(_)) => "rendered",
            Ok(None) => "skipped",
            Err(err) => outcome_label(err),
        };
        self.record_cost(
            job.kind,
            job.request.page_index,
            job.width,
            job.height,
            job.format,
            outcome,
        );
        result
    }

    fn paint(
        &self,
        session: &Session,
        job: &Job,
        handle: &WatchdogHandle,
    ) -> Result<Option<Bitmap>, RenderError> {
        let page_index = job.request.page_index;
        let _lock = match job.mode {
            RenderMode::Foreground => session.lock_render(),
            RenderMode::Background => match session.try_lock_render() {
                Some(lock) => lock,
                None => {
                    debug!(page = page_index, kind = job.kind, "render lock busy; skipping");
                    return Ok(None);
                }
            },
        };
        handle.check()?;

        // The page may have been latched or rendered while we waited
        if session.is_latched(page_index) {
            return Err(RenderError::MalformedPage { page: page_index });
        }
        if let Some(hit) = self.lookup(&job.slot)? {
            handle.check()?;
            return Ok(Some(hit));
        }

        let cache = self.sessions.cache();
        let mut target = self.allocate(job)?;
        let bytes = target.allocation_bytes();
        let level = cache.tracker().begin_allocation(bytes);
        if level.is_elevated() {
            cache.signal(FallbackSignal::Pressure(level));
        }

        let foreground = job.mode == RenderMode::Foreground;
        let painted = {
            let mut report = |fraction: f32| {
                handle.notify_progress();
                if foreground {
                    self.progress.update(page_index, fraction);
                }
            };
            let mut control = PaintControl::new(handle.token(), &mut report);
            session.call(|engine, document| {
                let painted = engine.paint(document, &job.request, &mut target, &mut control);
                if engine.capabilities().page_cleanup {
                    if let Err(err) = engine.release_page(document, page_index) {
                        debug!(page = page_index, %err, "page cleanup failed");
                    }
                }
                painted
            })
        };
        cache.tracker().end_allocation(bytes);

        match painted {
            Ok(()) => {
                session.health().record_success(page_index);
                let copy = match target.try_copy() {
                    Ok(copy) => copy,
                    Err(err) => {
                        cache.pool().release(target);
                        cache.signal(FallbackSignal::AllocationFailure);
                        return Err(err.into());
                    }
                };
                self.store(&job.slot, target);
                Ok(Some(copy))
            }
            Err(err) => {
                cache.pool().release(target);
                Err(self.failure(session, page_index, err))
            }
        }
    }

    fn allocate(&self, job: &Job) -> Result<Bitmap, RenderError> {
        let cache = self.sessions.cache();
        if let Some(bitmap) = cache.pool().acquire(job.width, job.height, job.format) {
            return Ok(bitmap);
        }

        Bitmap::try_new(job.width, job.height, job.format).map_err(|err| {
            warn!(bytes = err.bytes, width = job.width, height = job.height, "render target allocation failed");
            cache.signal(FallbackSignal::AllocationFailure);
            RenderError::from(err)
        })
    }

    /// Record a renderer failure against the page and translate it
    fn failure(&self, session: &Session, page_index: u32, err: PdfEngineError) -> RenderError {
        let kind = self.sessions.heuristic().classify(&err);
        let latched = session.health().record_failure(page_index, kind);

        match err {
            PdfEngineError::Cancelled(cancelled) => cancelled.into(),
            PdfEngineError::OutOfMemory(alloc) => {
                self.sessions
                    .cache()
                    .signal(FallbackSignal::AllocationFailure);
                alloc.into()
            }
            PdfEngineError::Reentrant(reentrant) => RenderError::Reentrant(reentrant),
            PdfEngineError::InvalidHandle(_) => RenderError::NoSession,
            PdfEngineError::PageOutOfRange { page, page_count } => {
                RenderError::PageOutOfRange { page, page_count }
            }
            other if latched => {
                warn!(page = page_index, err = %other, "page latched malformed");
                self.sessions.telemetry().record_non_fatal(
                    &other,
                    &metadata([
                        ("operation", "render".to_owned()),
                        ("page", page_index.to_string()),
                        ("latched", "true".to_owned()),
                    ]),
                );
                RenderError::MalformedPage { page: page_index }
            }
            other => {
                debug!(
                    page = page_index,
                    failures = session.health().failures(page_index),
                    err = %other,
                    "render failed"
                );
                RenderError::Native(other)
            }
        }
    }

    fn lookup(&self, slot: &Slot) -> Result<Option<Bitmap>, RenderError> {
        let cache = self.sessions.cache();
        let found = match slot {
            Slot::Page(key) => cache.get(key)?,
            Slot::Named(name) => cache.get_named(name)?,
        };
        Ok(found)
    }

    /// Cache hit for `slot`, dropped if `token` was cancelled by the time it was read
    fn cached(
        &self,
        slot: &Slot,
        token: &CancellationToken,
    ) -> Result<Option<Bitmap>, RenderError> {
        let hit = self.lookup(slot)?;
        if hit.is_some() {
            // A replacement document may have filled the slot since the last check
            token.check()?;
        }
        Ok(hit)
    }

    fn store(&self, slot: &Slot, bitmap: Bitmap) {
        let cache = self.sessions.cache();
        match slot {
            Slot::Page(key) => cache.put(*key, bitmap),
            Slot::Named(name) => cache.put_named(name, bitmap),
        }
    }

    fn record_cost(
        &self,
        kind: &'static str,
        page_index: u32,
        width: u32,
        height: u32,
        format: PixelFormat,
        outcome: &'static str,
    ) {
        self.sessions.telemetry().render_cost(&RenderCost {
            kind,
            page_index,
            width,
            height,
            estimated_bytes: required_bytes(width, height, format).unwrap_or(usize::MAX),
            outcome,
        });
    }
}

fn page_size(session: &Session, page_index: u32) -> PageSize {
    session.page_size(page_index).unwrap_or(PageSize::LETTER)
}

fn outcome_label(err: &RenderError) -> &'static str {
    match err {
        RenderError::PageTooLarge(_) => "too_large",
        RenderError::MalformedPage { .. } => "malformed",
        RenderError::OutOfMemory { .. } => "out_of_memory",
        RenderError::Timeout => "timeout",
        RenderError::Cancelled(_) => "cancelled",
        _ => "failed",
    }
}

/// Neighbours of `center` within `radius`, nearest first; at equal distance
/// the following page comes first
fn prefetch_order(center: u32, radius: u32, page_count: u32) -> Vec<u32> {
    let mut order = Vec::new();
    for distance in 1..=radius {
        if let Some(after) = center.checked_add(distance).filter(|&page| page < page_count) {
            order.push(after);
        }
        if let Some(before) = center.checked_sub(distance) {
            if before < page_count {
                order.push(before);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewerConfig;
    use crate::source::Locator;
    use quire_engine::LopdfEngine;
    use quire_repair::fixtures::PdfFixture;
    use quire_watchdog::CancelReason;
    use tempfile::TempDir;

    #[test]
    fn test_cache_hits_are_dropped_once_cancelled() {
        let dir = TempDir::new().unwrap();
        let mut config = ViewerConfig::default();
        config.cache.cache_dir = dir.path().join("cache");
        let engine = Arc::new(LopdfEngine::new());
        let sessions = Arc::new(SessionManager::new(config, engine).unwrap());
        let path = dir.path().join("a.pdf");
        PdfFixture::flat(1).write_to(&path).unwrap();
        sessions.open(&Locator::File(path), None).unwrap();

        let pipeline = RenderPipeline::new(Arc::clone(&sessions));
        pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap();
        let slot = Slot::Page(PageBitmapKey::new(0, 100, QualityProfile::Balanced));

        let live = CancellationToken::new();
        assert!(pipeline.cached(&slot, &live).unwrap().is_some());

        let replaced = CancellationToken::new();
        replaced.cancel_with(CancelReason::SessionReplaced);
        assert!(matches!(
            pipeline.cached(&slot, &replaced),
            Err(RenderError::Cancelled(CancelReason::SessionReplaced))
        ));

        let missing = Slot::Named("thumb:0:1".to_owned());
        assert!(pipeline.cached(&missing, &replaced).unwrap().is_none());
    }

    #[test]
    fn test_prefetch_order() {
        assert_eq!(prefetch_order(5, 2, 10), vec![6, 4, 7, 3]);
        assert_eq!(prefetch_order(0, 2, 10), vec![1, 2]);
        assert_eq!(prefetch_order(9, 2, 10), vec![8, 7]);
        assert!(prefetch_order(0, 3, 1).is_empty());
        assert!(prefetch_order(4, 0, 10).is_empty());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&RenderError::Timeout), "timeout");
        assert_eq!(
            outcome_label(&RenderError::MalformedPage { page: 1 }),
            "malformed"
        );
        assert_eq!(outcome_label(&RenderError::NoSession), "failed");
    }
}
