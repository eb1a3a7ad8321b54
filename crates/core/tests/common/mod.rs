#![allow(dead_code)]

use parking_lot::Mutex;
use quire_cache::{AllocationError, Bitmap};
use quire_core::{Locator, Metadata, RenderCost, SessionManager, TelemetrySink, ViewerConfig};
use quire_engine::{
    DocumentHandle, EngineCapabilities, OpenSource, PageSize, PaintControl, PaintRequest,
    PdfEngine, PdfEngineError,
};
use quire_repair::fixtures::PdfFixture;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// What the scripted engine does when asked to paint a page
#[derive(Debug, Clone)]
pub enum PaintScript {
    /// Backend error with this text on every call
    Fail(&'static str),
    /// Backend error for the first `n` calls, then success
    FailTimes(u32, &'static str),
    Malformed,
    OutOfMemory,
    /// Sleep without reporting progress, polling cancellation
    Stall(Duration),
    /// Wait on the barrier twice: once on entry, once before finishing
    Hold(Arc<Barrier>),
}

/// In-memory engine with scripted per-page behaviour
pub struct ScriptedEngine {
    page_count: u32,
    page_size: PageSize,
    open_failures: AtomicU32,
    open_delay: Mutex<Option<Duration>>,
    scripts: Mutex<HashMap<u32, PaintScript>>,
    paint_calls: Mutex<HashMap<u32, u32>>,
    released: Mutex<Vec<u32>>,
    clipped_paint: bool,
    open_calls: AtomicU32,
    live: Mutex<HashSet<DocumentHandle>>,
    next_handle: AtomicU64,
}

impl ScriptedEngine {
    pub fn new(page_count: u32) -> Self {
        Self {
            page_count,
            page_size: PageSize::LETTER,
            open_failures: AtomicU32::new(0),
            open_delay: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
            paint_calls: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            clipped_paint: true,
            open_calls: AtomicU32::new(0),
            live: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(0),
        }
    }

    pub fn with_page_size(mut self, width_pt: f32, height_pt: f32) -> Self {
        self.page_size = PageSize {
            width_pt,
            height_pt,
        };
        self
    }

    /// Advertise painting that rasterises the whole page for every clip
    pub fn whole_page_paint(mut self) -> Self {
        self.clipped_paint = false;
        self
    }

    /// Fail the next `count` opens with a parse-like error
    pub fn fail_opens(&self, count: u32) {
        self.open_failures.store(count, Ordering::SeqCst);
    }

    pub fn delay_open(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn script(&self, page_index: u32, script: PaintScript) {
        self.scripts.lock().insert(page_index, script);
    }

    pub fn paint_calls(&self, page_index: u32) -> u32 {
        self.paint_calls
            .lock()
            .get(&page_index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_paint_calls(&self) -> u32 {
        self.paint_calls.lock().values().sum()
    }

    /// Pages passed to `release_page`, in call order
    pub fn released_pages(&self) -> Vec<u32> {
        self.released.lock().clone()
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> Vec<DocumentHandle> {
        self.live.lock().iter().copied().collect()
    }

    fn check_live(&self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        if self.live.lock().contains(&handle) {
            Ok(())
        } else {
            Err(PdfEngineError::InvalidHandle(handle.raw()))
        }
    }

    fn check_page(&self, page_index: u32) -> Result<(), PdfEngineError> {
        if page_index < self.page_count {
            Ok(())
        } else {
            Err(PdfEngineError::PageOutOfRange {
                page: page_index,
                page_count: self.page_count,
            })
        }
    }

    fn next_script(&self, page_index: u32) -> Option<PaintScript> {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&page_index) {
            Some(PaintScript::FailTimes(remaining, message)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Some(PaintScript::Fail(*message))
                } else {
                    None
                }
            }
            other => other.cloned(),
        }
    }
}

impl PdfEngine for ScriptedEngine {
    fn open(&self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if let OpenSource::Path(path) = &source {
            if !path.exists() {
                return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
            }
        }

        let failed = self
            .open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PdfEngineError::Backend("invalid xref table".to_owned()));
        }

        let handle = DocumentHandle::from_raw(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.live.lock().insert(handle);
        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        self.check_live(handle)?;
        Ok(self.page_count)
    }

    fn page_size(&self, handle: DocumentHandle, page_index: u32) -> Result<PageSize, PdfEngineError> {
        self.check_live(handle)?;
        self.check_page(page_index)?;
        Ok(self.page_size)
    }

    fn paint(
        &self,
        handle: DocumentHandle,
        request: &PaintRequest,
        target: &mut Bitmap,
        control: &mut PaintControl<'_>,
    ) -> Result<(), PdfEngineError> {
        self.check_live(handle)?;
        self.check_page(request.page_index)?;
        *self
            .paint_calls
            .lock()
            .entry(request.page_index)
            .or_insert(0) += 1;

        match self.next_script(request.page_index) {
            None => {}
            Some(PaintScript::Fail(message)) => {
                return Err(PdfEngineError::Backend(message.to_owned()));
            }
            Some(PaintScript::FailTimes(..)) => {}
            Some(PaintScript::Malformed) => {
                return Err(PdfEngineError::Malformed("unresolvable content".to_owned()));
            }
            Some(PaintScript::OutOfMemory) => {
                return Err(PdfEngineError::OutOfMemory(AllocationError {
                    bytes: usize::MAX,
                    width: target.width(),
                    height: target.height(),
                }));
            }
            Some(PaintScript::Stall(duration)) => {
                let start = Instant::now();
                while start.elapsed() < duration {
                    control.check()?;
                    thread::sleep(Duration::from_millis(5));
                }
            }
            Some(PaintScript::Hold(barrier)) => {
                barrier.wait();
                barrier.wait();
            }
        }

        control.check()?;
        target.fill_rgba([255, 255, 255, 255]);
        control.report(1.0);
        Ok(())
    }

    fn close(&self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        if self.live.lock().remove(&handle) {
            Ok(())
        } else {
            Err(PdfEngineError::InvalidHandle(handle.raw()))
        }
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            outline: false,
            page_cleanup: true,
            clipped_paint: self.clipped_paint,
        }
    }

    fn release_page(&self, handle: DocumentHandle, page_index: u32) -> Result<(), PdfEngineError> {
        self.check_live(handle)?;
        self.released.lock().push(page_index);
        Ok(())
    }
}

/// Telemetry sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingTelemetry {
    pub breadcrumbs: Mutex<Vec<String>>,
    pub non_fatal: Mutex<Vec<(String, Metadata)>>,
    pub costs: Mutex<Vec<RenderCost>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn breadcrumb(&self, message: &str) {
        self.breadcrumbs.lock().push(message.to_owned());
    }

    fn record_non_fatal(&self, error: &(dyn Error + 'static), metadata: &Metadata) {
        self.non_fatal
            .lock()
            .push((error.to_string(), metadata.clone()));
    }

    fn render_cost(&self, cost: &RenderCost) {
        self.costs.lock().push(cost.clone());
    }
}

pub fn test_config(dir: &Path) -> ViewerConfig {
    let mut config = ViewerConfig::default();
    config.cache.cache_dir = dir.join("cache");
    config
}

pub fn manager(config: ViewerConfig, engine: Arc<dyn PdfEngine>) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(config, engine).expect("session manager"))
}

pub fn manager_with_telemetry(
    config: ViewerConfig,
    engine: Arc<dyn PdfEngine>,
    telemetry: Arc<RecordingTelemetry>,
) -> Arc<SessionManager> {
    let manager = SessionManager::new(config, engine)
        .expect("session manager")
        .with_telemetry(telemetry);
    Arc::new(manager)
}

/// Write a fixture document and return its locator
pub fn write_pdf(dir: &Path, name: &str, fixture: PdfFixture) -> Locator {
    let path = dir.join(name);
    fixture.write_to(&path).expect("write fixture");
    Locator::File(path)
}
