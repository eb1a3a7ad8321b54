mod common;

use common::{
    manager, manager_with_telemetry, test_config, write_pdf, PaintScript, RecordingTelemetry,
    ScriptedEngine,
};
use quire_cache::{PixelFormat, QualityProfile};
use quire_core::{
    RenderError, RenderMode, RenderPipeline, RenderProgress, SessionManager, SizeSuggestion,
    ViewerConfig,
};
use quire_engine::ClipRect;
use quire_repair::fixtures::PdfFixture;
use quire_watchdog::{CancelReason, CancellationToken};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    engine: Arc<ScriptedEngine>,
    sessions: Arc<SessionManager>,
    pipeline: RenderPipeline,
}

fn harness_with(engine: ScriptedEngine, tweak: impl FnOnce(&mut ViewerConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);

    let engine = Arc::new(engine);
    let sessions = manager(config, engine.clone());
    let locator = write_pdf(dir.path(), "doc.pdf", PdfFixture::flat(8));
    sessions.open(&locator, None).unwrap();

    Harness {
        _dir: dir,
        engine,
        pipeline: RenderPipeline::new(Arc::clone(&sessions)),
        sessions,
    }
}

fn harness(pages: u32) -> Harness {
    harness_with(ScriptedEngine::new(pages), |_| {})
}

fn rect(x: f32, y: f32, width: f32, height: f32) -> ClipRect {
    ClipRect {
        x,
        y,
        width,
        height,
    }
}

#[test]
fn page_width_and_aspect_ratio() {
    let h = harness_with(ScriptedEngine::new(2).with_page_size(600.0, 800.0), |_| {});

    let bitmap = h
        .pipeline
        .render_page(1, 300, QualityProfile::HighDetail)
        .unwrap()
        .unwrap();

    assert_eq!(bitmap.width(), 300);
    assert_eq!(bitmap.height(), 400);
    assert_eq!(bitmap.format(), PixelFormat::Rgba8888);
    let ratio = bitmap.width() as f32 / bitmap.height() as f32;
    assert!((ratio - 0.75).abs() < 0.01);
}

#[test]
fn low_memory_profile_uses_16_bit_pixels() {
    let h = harness(1);

    let bitmap = h
        .pipeline
        .render_page(0, 100, QualityProfile::LowMemory)
        .unwrap()
        .unwrap();
    assert_eq!(bitmap.format(), PixelFormat::Rgb565);
}

#[test]
fn cached_pages_are_not_painted_again() {
    let h = harness(3);

    let first = h.pipeline.render_page(2, 120, QualityProfile::Balanced).unwrap().unwrap();
    let second = h.pipeline.render_page(2, 120, QualityProfile::Balanced).unwrap().unwrap();

    assert_eq!(h.engine.paint_calls(2), 1);
    assert_eq!(first.pixels(), second.pixels());
}

#[test]
fn tiles_outside_the_page_are_clamped() {
    let h = harness(1);

    let partial = h
        .pipeline
        .render_tile(0, rect(500.0, 700.0, 400.0, 400.0), 1.0, QualityProfile::Balanced)
        .unwrap()
        .unwrap();
    assert_eq!((partial.width(), partial.height()), (112, 92));

    let outside = h
        .pipeline
        .render_tile(0, rect(-900.0, 5000.0, 10.0, 10.0), 2.0, QualityProfile::Balanced)
        .unwrap()
        .unwrap();
    assert_eq!((outside.width(), outside.height()), (1, 1));
}

#[test]
fn tiles_are_cached_under_their_region() {
    let h = harness(1);
    let region = rect(0.0, 0.0, 100.0, 100.0);

    h.pipeline.render_tile(0, region, 2.0, QualityProfile::Balanced).unwrap();
    h.pipeline.render_tile(0, region, 2.0, QualityProfile::Balanced).unwrap();
    assert_eq!(h.engine.paint_calls(0), 1);

    h.pipeline.render_tile(0, region, 3.0, QualityProfile::Balanced).unwrap();
    assert_eq!(h.engine.paint_calls(0), 2);
}

#[test]
fn oversized_page_suggests_width() {
    let h = harness_with(ScriptedEngine::new(1), |config| config.render.max_dimension = 1000);

    let err = h
        .pipeline
        .render_page(0, 5000, QualityProfile::Balanced)
        .unwrap_err();
    let Some(SizeSuggestion::Width {
        requested,
        suggested,
    }) = err.suggestion()
    else {
        panic!("expected a width suggestion, got {err:?}");
    };

    assert_eq!(requested, 5000);
    assert!(suggested < requested);
    h.pipeline
        .render_page(0, suggested, QualityProfile::Balanced)
        .unwrap()
        .unwrap();
    assert_eq!(h.engine.paint_calls(0), 1);
}

#[test]
fn oversized_tiles_suggest_smaller_scale() {
    let h = harness_with(ScriptedEngine::new(1), |config| config.render.max_dimension = 2048);
    let page = rect(0.0, 0.0, 612.0, 792.0);

    for scale in [4.0f32, 8.0, 50.0] {
        let err = h
            .pipeline
            .render_tile(0, page, scale, QualityProfile::Balanced)
            .unwrap_err();
        match err {
            RenderError::PageTooLarge(SizeSuggestion::Scale {
                requested,
                suggested,
            }) => {
                assert_eq!(requested, scale);
                assert!(suggested < requested);
            }
            other => panic!("expected a scale suggestion, got {other:?}"),
        }
    }
    assert_eq!(h.engine.total_paint_calls(), 0);
}

#[test]
fn page_latches_after_threshold_failures() {
    let h = harness(2);
    h.engine.script(0, PaintScript::Fail("glyph rasterizer busy"));

    let first = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(matches!(first, RenderError::Native(_)));

    let second = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(matches!(second, RenderError::MalformedPage { page: 0 }));

    let third = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(third.is_malformed());
    assert_eq!(h.engine.paint_calls(0), 2);

    let session = h.sessions.current().unwrap();
    assert_eq!(session.latched_pages(), vec![0]);
    assert!(h.pipeline.render_page(1, 100, QualityProfile::Balanced).is_ok());
}

#[test]
fn configured_threshold_is_honoured() {
    let h = harness_with(ScriptedEngine::new(1), |config| {
        config.render.malformed_threshold = 3
    });
    h.engine.script(0, PaintScript::Fail("transient"));

    for _ in 0..2 {
        let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
        assert!(matches!(err, RenderError::Native(_)));
    }
    let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(err.is_malformed());
    assert_eq!(h.engine.paint_calls(0), 3);
}

#[test]
fn malformed_error_text_latches_immediately() {
    let h = harness(1);
    h.engine.script(0, PaintScript::Fail("Corrupt content stream"));

    let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(err.is_malformed());
    h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert_eq!(h.engine.paint_calls(0), 1);
}

#[test]
fn success_resets_failure_counter() {
    let h = harness(1);
    h.engine.script(0, PaintScript::FailTimes(1, "transient"));

    assert!(h.pipeline.render_page(0, 100, QualityProfile::Balanced).is_err());
    assert!(h.pipeline.render_page(0, 100, QualityProfile::Balanced).is_ok());

    h.engine.script(0, PaintScript::FailTimes(1, "transient"));
    let err = h.pipeline.render_page(0, 101, QualityProfile::Balanced).unwrap_err();
    assert!(matches!(err, RenderError::Native(_)));
    assert!(!h.sessions.current().unwrap().is_latched(0));
}

#[test]
fn out_of_memory_never_latches() {
    let h = harness(1);
    h.engine.script(0, PaintScript::OutOfMemory);
    let fallback = h.sessions.subscribe_fallback();

    for _ in 0..4 {
        let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory { .. }));
    }

    assert!(!h.sessions.current().unwrap().is_latched(0));
    assert_eq!(h.engine.paint_calls(0), 4);
    assert!(*fallback.borrow());
}

#[test]
fn placeholder_for_malformed_page() {
    let h = harness(1);
    h.engine.script(0, PaintScript::Malformed);

    let bitmap = h
        .pipeline
        .render_page_or_placeholder(0, 60, QualityProfile::Balanced)
        .unwrap();

    assert_eq!(bitmap.width(), 60);
    assert_eq!(bitmap.height(), 78);
    assert_eq!(&bitmap.to_rgba8()[..4], &[232, 232, 232, 255]);
}

#[test]
fn render_without_progress_times_out() {
    let h = harness_with(ScriptedEngine::new(1), |config| {
        config.render.render_timeout_ms = 50
    });
    h.engine.script(0, PaintScript::Stall(Duration::from_secs(2)));

    let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();

    assert!(matches!(err, RenderError::Timeout));
    assert!(!h.sessions.current().unwrap().is_latched(0));
}

#[test]
fn caller_cancellation() {
    let h = harness(1);
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .pipeline
        .render_page_with(0, 100, QualityProfile::Balanced, RenderMode::Foreground, Some(&token))
        .unwrap_err();

    assert!(matches!(err, RenderError::Cancelled(CancelReason::Caller)));
    assert_eq!(h.engine.paint_calls(0), 0);
}

#[test]
fn background_render_skips_when_lock_is_held() {
    let h = harness(2);
    let barrier = Arc::new(Barrier::new(2));
    h.engine.script(0, PaintScript::Hold(Arc::clone(&barrier)));

    thread::scope(|scope| {
        let foreground = scope.spawn(|| h.pipeline.render_page(0, 100, QualityProfile::Balanced));

        // Foreground paint is now inside the native call
        barrier.wait();
        let skipped = h
            .pipeline
            .render_page_with(1, 100, QualityProfile::Balanced, RenderMode::Background, None)
            .unwrap();
        assert!(skipped.is_none());
        assert!(h.pipeline.render_thumbnail(1, 50).unwrap().is_none());
        barrier.wait();

        assert!(foreground.join().unwrap().unwrap().is_some());
    });

    assert_eq!(h.engine.paint_calls(1), 0);
}

#[test]
fn thumbnails_use_their_own_slot() {
    let h = harness(1);

    let thumb = h.pipeline.render_thumbnail(0, 80).unwrap().unwrap();
    assert_eq!(thumb.width(), 80);
    assert_eq!(thumb.format(), PixelFormat::Rgb565);
    assert!(h.sessions.cache().contains_named("thumb:0:80"));

    h.pipeline.render_thumbnail(0, 80).unwrap();
    assert_eq!(h.engine.paint_calls(0), 1);
}

#[test]
fn prefetch_renders_neighbours() {
    let h = harness(6);
    h.engine.script(4, PaintScript::Fail("transient"));
    h.pipeline.render_page(2, 100, QualityProfile::Balanced).unwrap();

    let report = h
        .pipeline
        .prefetch(3, Some(2), 100, QualityProfile::Balanced)
        .unwrap();

    assert_eq!(report.cached, vec![2]);
    assert_eq!(report.rendered, vec![5, 1]);
    assert_eq!(report.failed, vec![4]);
    assert!(report.skipped.is_empty());
    assert_eq!(h.engine.paint_calls(3), 0);
}

#[test]
fn progress_returns_to_idle() {
    let h = harness(1);
    let progress = h.pipeline.subscribe_progress();

    h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap();
    assert_eq!(*progress.borrow(), RenderProgress::Idle);
}

#[test]
fn out_of_range_and_no_session() {
    let h = harness(2);

    let err = h.pipeline.render_page(2, 100, QualityProfile::Balanced).unwrap_err();
    assert!(matches!(
        err,
        RenderError::PageOutOfRange {
            page: 2,
            page_count: 2
        }
    ));

    h.sessions.close();
    let err = h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();
    assert!(matches!(err, RenderError::NoSession));
}

#[test]
fn render_cost_is_recorded_on_failure() {
    let dir = TempDir::new().unwrap();
    let telemetry = Arc::new(RecordingTelemetry::default());
    let engine = Arc::new(ScriptedEngine::new(1));
    let sessions = manager_with_telemetry(test_config(dir.path()), engine.clone(), telemetry.clone());
    let pipeline = RenderPipeline::new(Arc::clone(&sessions));
    sessions
        .open(&write_pdf(dir.path(), "a.pdf", PdfFixture::flat(1)), None)
        .unwrap();

    engine.script(0, PaintScript::Fail("transient"));
    pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap_err();

    let costs = telemetry.costs.lock();
    assert_eq!(costs.len(), 1);
    assert_eq!(costs[0].outcome, "failed");
    assert_eq!(costs[0].width, 100);
    assert_eq!(costs[0].estimated_bytes, 100 * 129 * 4);
}

#[test]
fn pages_are_released_after_painting() {
    let h = harness(3);
    h.engine.script(2, PaintScript::Fail("transient"));

    h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap();
    h.pipeline.render_page(0, 100, QualityProfile::Balanced).unwrap();
    h.pipeline.render_page(2, 100, QualityProfile::Balanced).unwrap_err();

    assert_eq!(h.engine.released_pages(), vec![0, 2]);
}

#[test]
fn whole_page_engines_size_tiles_by_the_page() {
    let tile = rect(0.0, 0.0, 32.0, 32.0);

    let clipped = harness_with(ScriptedEngine::new(1), |config| config.render.max_dimension = 2048);
    let bitmap = clipped
        .pipeline
        .render_tile(0, tile, 8.0, QualityProfile::Balanced)
        .unwrap()
        .unwrap();
    assert_eq!((bitmap.width(), bitmap.height()), (256, 256));

    let whole_page = harness_with(ScriptedEngine::new(1).whole_page_paint(), |config| {
        config.render.max_dimension = 2048
    });
    let err = whole_page
        .pipeline
        .render_tile(0, tile, 8.0, QualityProfile::Balanced)
        .unwrap_err();
    let Some(SizeSuggestion::Scale { suggested, .. }) = err.suggestion() else {
        panic!("expected a scale suggestion, got {err:?}");
    };
    assert!(suggested < 8.0);
    assert_eq!(whole_page.engine.total_paint_calls(), 0);

    whole_page
        .pipeline
        .render_tile(0, tile, suggested, QualityProfile::Balanced)
        .unwrap()
        .unwrap();
}
