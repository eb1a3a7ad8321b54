//! Document sessions
//!
//! [`SessionManager`] owns at most one open [`Session`]. Opening a new
//! document validates it first, then tears the previous session down
//! completely (native handle closed, bitmap cache and pool emptied, failure
//! state dropped) before the new one is published. A rejected source
//! therefore leaves the current session untouched.

use crate::config::ViewerConfig;
use crate::error::{OpenError, SetupError};
use crate::malformed::{MalformedHeuristic, PageHealth};
use crate::source::{ContentResolver, Locator, RemoteStore, ResolvedSource, SourceResolver};
use crate::telemetry::{metadata, TelemetrySink, TracingTelemetry};
use parking_lot::{Mutex, MutexGuard, RwLock};
use quire_cache::{
    BitmapCache, FallbackSignal, MemoryStats, TieredCacheStats, TrimLevel, Transition,
};
use quire_engine::{
    DocumentHandle, OpenSource, OutlineItem, PageSize, PdfEngine, PdfEngineError,
    ReentrancyGuard,
};
use quire_repair::{repair_trigger, scan_path, RepairError, RepairStore, SuspectMatcher};
use quire_watchdog::{
    ensure_background, CancelReason, CancellationToken, Watchdog, WatchdogHandle,
};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pages described between cancellation checks while loading page sizes
const SIZE_CHECK_INTERVAL: u32 = 256;

/// One open document
pub struct Session {
    document_id: String,
    source: ResolvedSource,
    repaired: Option<PathBuf>,
    page_count: u32,
    page_sizes: Vec<PageSize>,
    handle: DocumentHandle,
    engine: Arc<dyn PdfEngine>,
    token: CancellationToken,
    render_lock: Mutex<()>,
    guard: ReentrancyGuard,
    health: Mutex<PageHealth>,
    closed: AtomicBool,
}

impl Session {
    /// Stable identity: SHA-256 of the locator string
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn locator(&self) -> &Locator {
        &self.source.locator
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Page size in points; `None` past the last page
    pub fn page_size(&self, page_index: u32) -> Option<PageSize> {
        self.page_sizes.get(page_index as usize).copied()
    }

    pub fn handle(&self) -> DocumentHandle {
        self.handle
    }

    /// The file the native renderer opened
    pub fn path(&self) -> &Path {
        self.repaired.as_deref().unwrap_or(&self.source.path)
    }

    /// Whether paints of a clip cost only the clip
    pub fn clipped_paint(&self) -> bool {
        self.engine.capabilities().clipped_paint
    }

    pub fn is_repaired(&self) -> bool {
        self.repaired.is_some()
    }

    /// Root token; cancelled when the session closes
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_latched(&self, page_index: u32) -> bool {
        self.health.lock().is_latched(page_index)
    }

    pub fn latched_pages(&self) -> Vec<u32> {
        self.health.lock().latched_pages()
    }

    pub(crate) fn health(&self) -> MutexGuard<'_, PageHealth> {
        self.health.lock()
    }

    pub(crate) fn lock_render(&self) -> MutexGuard<'_, ()> {
        self.render_lock.lock()
    }

    pub(crate) fn try_lock_render(&self) -> Option<MutexGuard<'_, ()>> {
        self.render_lock.try_lock()
    }

    /// Run one native call on this session's handle
    ///
    /// The caller holds the render lock; the guard only verifies that no
    /// other call overlaps.
    pub(crate) fn call<T>(
        &self,
        f: impl FnOnce(&dyn PdfEngine, DocumentHandle) -> Result<T, PdfEngineError>,
    ) -> Result<T, PdfEngineError> {
        let _entered = self.guard.enter()?;
        if self.is_closed() {
            return Err(PdfEngineError::InvalidHandle(self.handle.raw()));
        }
        f(self.engine.as_ref(), self.handle)
    }

    /// Cancel in-flight work, wait for the render lock, close the handle
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel_with(CancelReason::SessionReplaced);

        let _lock = self.render_lock.lock();
        match self.guard.enter() {
            Ok(_entered) => {
                if let Err(err) = self.engine.close(self.handle) {
                    warn!(handle = self.handle.raw(), %err, "failed to close native handle");
                }
            }
            Err(err) => warn!(handle = self.handle.raw(), %err, "handle busy at close"),
        }
        self.health.lock().clear();
        self.source.discard();
        debug!(document = %self.document_id, "session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("document_id", &self.document_id)
            .field("locator", &self.source.locator)
            .field("page_count", &self.page_count)
            .field("handle", &self.handle)
            .field("repaired", &self.repaired)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What a successful native open produced
struct OpenedDocument {
    handle: DocumentHandle,
    page_count: u32,
    page_sizes: Vec<PageSize>,
    outline: Vec<OutlineItem>,
    repaired: Option<PathBuf>,
}

/// Owns the current session and everything shared across sessions
pub struct SessionManager {
    config: ViewerConfig,
    engine: Arc<dyn PdfEngine>,
    cache: Arc<BitmapCache>,
    repairs: RepairStore,
    suspects: SuspectMatcher,
    sources: SourceResolver,
    heuristic: MalformedHeuristic,
    telemetry: Arc<dyn TelemetrySink>,
    current: RwLock<Option<Arc<Session>>>,
    open_lock: Mutex<()>,
    outline_tx: watch::Sender<Arc<Vec<OutlineItem>>>,
}

impl SessionManager {
    pub fn new(config: ViewerConfig, engine: Arc<dyn PdfEngine>) -> Result<Self, SetupError> {
        config.validate()?;
        let cache = Arc::new(BitmapCache::from_config(&config.cache)?);
        let repairs = RepairStore::open(config.cache.repaired_dir())?;
        let suspects = SuspectMatcher::new(&config.repair)?;
        let heuristic = MalformedHeuristic::new(&config.render.malformed_patterns)?;
        let sources = SourceResolver::new(config.session.clone(), config.cache.staging_dir());
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingTelemetry);
        observe_disk_errors(&cache, &telemetry);
        let (outline_tx, _) = watch::channel(Arc::new(Vec::new()));

        info!(
            repaired_dir = %repairs.dir().display(),
            memory_limit = cache.memory_limit(),
            "session manager ready"
        );

        Ok(Self {
            config,
            engine,
            cache,
            repairs,
            suspects,
            sources,
            heuristic,
            telemetry,
            current: RwLock::new(None),
            open_lock: Mutex::new(()),
            outline_tx,
        })
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        observe_disk_errors(&self.cache, &telemetry);
        self.telemetry = telemetry;
        self
    }

    pub fn with_content_resolver(mut self, resolver: Arc<dyn ContentResolver>) -> Self {
        self.sources = self.sources.with_content_resolver(resolver);
        self
    }

    pub fn with_remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.sources = self.sources.with_remote_store(store);
        self
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BitmapCache> {
        &self.cache
    }

    pub fn repair_store(&self) -> &RepairStore {
        &self.repairs
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    pub(crate) fn heuristic(&self) -> &MalformedHeuristic {
        &self.heuristic
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().clone()
    }

    /// Open `locator`, replacing the current session
    ///
    /// Runs under the open watchdog; `cancel` lets the caller abandon the
    /// open. Must not be called from the interactive thread.
    pub fn open(
        &self,
        locator: &Locator,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Session>, OpenError> {
        ensure_background()?;
        let _open = self.open_lock.lock();
        let caller = cancel.cloned().unwrap_or_default();
        self.telemetry
            .breadcrumb(&format!("open {} ({})", locator.display_name(), locator.scheme()));

        let watchdog = Watchdog::new(self.config.session.open_timeout());
        let result = watchdog.supervise(&caller, |handle| self.open_supervised(locator, handle));

        match &result {
            Ok(session) => info!(
                document = %session.document_id(),
                pages = session.page_count(),
                repaired = session.is_repaired(),
                "document opened"
            ),
            Err(err) => {
                warn!(locator = %locator, %err, "open failed");
                self.telemetry.record_non_fatal(
                    err,
                    &metadata([
                        ("operation", "open".to_owned()),
                        ("scheme", locator.scheme().to_owned()),
                    ]),
                );
            }
        }
        result
    }

    /// Close the current session, if any; returns whether one was open
    pub fn close(&self) -> bool {
        let _open = self.open_lock.lock();
        self.close_current()
    }

    pub fn on_low_memory(&self) -> Option<Transition> {
        self.cache.signal(FallbackSignal::LowMemory)
    }

    pub fn on_trim_memory(&self, level: TrimLevel) -> Option<Transition> {
        self.cache.on_trim_memory(level)
    }

    pub fn on_memory_normal(&self) -> Option<Transition> {
        self.cache.signal(FallbackSignal::MemoryNormal)
    }

    pub fn subscribe_memory(&self) -> watch::Receiver<MemoryStats> {
        self.cache.tracker().subscribe()
    }

    pub fn subscribe_fallback(&self) -> watch::Receiver<bool> {
        self.cache.fallback().subscribe()
    }

    /// Outline of the current document; empty when closed or unsupported
    pub fn subscribe_outline(&self) -> watch::Receiver<Arc<Vec<OutlineItem>>> {
        self.outline_tx.subscribe()
    }

    pub fn cache_stats(&self) -> TieredCacheStats {
        self.cache.stats()
    }

    fn open_supervised(
        &self,
        locator: &Locator,
        watchdog: &WatchdogHandle,
    ) -> Result<Arc<Session>, OpenError> {
        let mut source = self.sources.resolve(locator, watchdog)?;
        watchdog.notify_progress();

        self.close_current();
        self.cache.tracker().reset_peak();
        let document_id = RepairStore::key_for(&locator.to_string());
        self.cache.set_scope(&document_id);

        let opened = match self.open_document(&source, watchdog) {
            Ok(opened) => opened,
            Err(err) => {
                source.discard();
                return Err(err);
            }
        };

        if opened.repaired.is_some() {
            // The repaired copy replaces the staged download
            source.discard();
            source.staged = false;
        }

        let session = Arc::new(Session {
            document_id,
            source,
            repaired: opened.repaired,
            page_count: opened.page_count,
            page_sizes: opened.page_sizes,
            handle: opened.handle,
            engine: Arc::clone(&self.engine),
            token: CancellationToken::new(),
            render_lock: Mutex::new(()),
            guard: ReentrancyGuard::new(),
            health: Mutex::new(PageHealth::new(self.config.render.malformed_threshold)),
            closed: AtomicBool::new(false),
        });

        *self.current.write() = Some(Arc::clone(&session));
        self.outline_tx.send_replace(Arc::new(opened.outline));
        Ok(session)
    }

    fn open_document(
        &self,
        source: &ResolvedSource,
        watchdog: &WatchdogHandle,
    ) -> Result<OpenedDocument, OpenError> {
        let key = source.locator.to_string();
        let mut repaired = self.repairs.lookup(&key);

        if let Some(path) = &repaired {
            debug!(path = %path.display(), "reusing repaired document");
        } else if self.config.repair.enabled {
            if let Some(trigger) = self.needs_repair(source, watchdog)? {
                info!(%trigger, "rebuilding page tree before open");
                self.telemetry.breadcrumb(&format!("repair: {trigger}"));
                match self.repair(source, watchdog) {
                    Ok(path) => repaired = Some(path),
                    Err(RepairError::Cancelled(cancelled)) => return Err(cancelled.into()),
                    Err(err) => {
                        warn!(%err, "scan-triggered repair failed; opening original");
                        self.telemetry.record_non_fatal(
                            &err,
                            &metadata([
                                ("operation", "repair".to_owned()),
                                ("trigger", trigger.to_string()),
                            ]),
                        );
                    }
                }
            }
        }

        let path = repaired.clone().unwrap_or_else(|| source.path.clone());
        let handle = match self.engine.open(OpenSource::Path(path)) {
            Ok(handle) => handle,
            Err(err) => {
                let (handle, path) = self.recover_open(source, repaired.is_some(), err, watchdog)?;
                repaired = Some(path);
                handle
            }
        };
        watchdog.notify_progress();

        match self.describe(handle, watchdog) {
            Ok((page_count, page_sizes, outline)) => Ok(OpenedDocument {
                handle,
                page_count,
                page_sizes,
                outline,
                repaired,
            }),
            Err(err) => {
                if let Err(close_err) = self.engine.close(handle) {
                    warn!(%close_err, "failed to close handle of rejected document");
                }
                Err(err)
            }
        }
    }

    /// The single repair-and-retry cycle after a failed native open
    fn recover_open(
        &self,
        source: &ResolvedSource,
        already_repaired: bool,
        err: PdfEngineError,
        watchdog: &WatchdogHandle,
    ) -> Result<(DocumentHandle, PathBuf), OpenError> {
        match err {
            PdfEngineError::EncryptedUnsupported => {
                return Err(OpenError::Unsupported(err.to_string()));
            }
            PdfEngineError::Cancelled(cancelled) => return Err(cancelled.into()),
            PdfEngineError::Io(io) => {
                return Err(OpenError::AccessDenied(format!("{}: {io}", source.locator)));
            }
            _ if already_repaired => return Err(OpenError::Corrupted(err.to_string())),
            _ => {}
        }

        watchdog.check()?;
        warn!(%err, "native open failed; repairing once");
        self.telemetry
            .breadcrumb(&format!("open failed, repairing: {err}"));

        let path = self.repair(source, watchdog).map_err(|repair_err| match repair_err {
            RepairError::Cancelled(cancelled) => cancelled.into(),
            other => OpenError::RepairFailed(other),
        })?;
        watchdog.notify_progress();

        let handle = self
            .engine
            .open(OpenSource::Path(path.clone()))
            .map_err(|retry| OpenError::Corrupted(format!("{err}; after repair: {retry}")))?;
        Ok((handle, path))
    }

    fn needs_repair(
        &self,
        source: &ResolvedSource,
        watchdog: &WatchdogHandle,
    ) -> Result<Option<quire_repair::RepairTrigger>, OpenError> {
        let report = match scan_path(&source.path, &self.config.repair, watchdog.token()) {
            Ok(report) => report,
            Err(RepairError::Cancelled(cancelled)) => return Err(cancelled.into()),
            Err(err) => {
                warn!(%err, "page-tree scan failed; skipping");
                return Ok(None);
            }
        };
        watchdog.notify_progress();
        debug!(
            verdict = ?report.verdict,
            bytes = report.bytes_scanned,
            max_kids = report.max_kids,
            "page-tree scan"
        );

        Ok(repair_trigger(&report, &source.name, Some(source.size), &self.suspects))
    }

    fn repair(&self, source: &ResolvedSource, watchdog: &WatchdogHandle) -> Result<PathBuf, RepairError> {
        let bytes = fs::read(&source.path)?;
        watchdog.notify_progress();
        let outcome = self.repairs.repair(
            &source.locator.to_string(),
            &bytes,
            &self.config.repair,
            watchdog.token(),
        )?;
        Ok(outcome.path().to_path_buf())
    }

    fn describe(
        &self,
        handle: DocumentHandle,
        watchdog: &WatchdogHandle,
    ) -> Result<(u32, Vec<PageSize>, Vec<OutlineItem>), OpenError> {
        watchdog.check()?;
        let page_count = self
            .engine
            .page_count(handle)
            .map_err(|err| OpenError::Corrupted(err.to_string()))?;
        if page_count == 0 {
            return Err(OpenError::Corrupted("document has no pages".to_owned()));
        }

        let mut page_sizes = Vec::with_capacity(page_count as usize);
        for page_index in 0..page_count {
            if page_index % SIZE_CHECK_INTERVAL == 0 {
                watchdog.check()?;
                watchdog.notify_progress();
            }
            let size = self.engine.page_size(handle, page_index).unwrap_or_else(|err| {
                debug!(page = page_index, %err, "page size unavailable; using Letter");
                PageSize::LETTER
            });
            page_sizes.push(size);
        }

        let outline = if self.engine.capabilities().outline {
            self.engine.outline(handle).unwrap_or_else(|err| {
                warn!(%err, "outline extraction failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        watchdog.check()?;

        Ok((page_count, page_sizes, outline))
    }

    fn close_current(&self) -> bool {
        let Some(session) = self.current.write().take() else {
            return false;
        };

        session.shutdown();
        self.cache.clear();
        self.cache.pool().clear();
        self.outline_tx.send_replace(Arc::new(Vec::new()));
        self.telemetry
            .breadcrumb(&format!("closed {}", session.locator().display_name()));
        info!(document = %session.document_id(), "session closed");
        true
    }
}

fn observe_disk_errors(cache: &BitmapCache, telemetry: &Arc<dyn TelemetrySink>) {
    let telemetry = Arc::clone(telemetry);
    cache.set_disk_error_observer(Arc::new(move |operation, err| {
        telemetry.record_non_fatal(
            err,
            &metadata([
                ("component", "disk-cache".to_owned()),
                ("operation", operation.to_owned()),
            ]),
        );
    }));
}
