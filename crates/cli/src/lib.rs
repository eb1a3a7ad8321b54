use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quire_cache::{Bitmap, QualityProfile};
use quire_core::{Locator, RenderPipeline, SessionManager, ViewerConfig};
use quire_engine::{default_engine as default_engine_without_pdfium, ClipRect, PdfEngine};
use quire_repair::{repair_bytes, repair_trigger, scan_path, ScanVerdict, SuspectMatcher};
use quire_watchdog::CancellationToken;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quire")]
#[command(about = "Inspect, repair and render PDF documents")]
pub struct Cli {
    /// Viewer configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// More log output on stderr; RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable document metadata.
    Info {
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    /// Scan the page tree for oversized nodes without opening the document.
    Scan {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Rebuild the page tree into a balanced one.
    Repair {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Render a page to PNG.
    Render {
        #[arg(value_name = "SOURCE")]
        source: String,
        /// 1-based page number
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 1080)]
        width: u32,
        #[arg(long, default_value = "balanced")]
        quality: QualityProfile,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Render a page region to PNG.
    Tile {
        #[arg(value_name = "SOURCE")]
        source: String,
        /// 1-based page number
        #[arg(long, default_value_t = 1)]
        page: u32,
        /// Region origin and size in points
        #[arg(long, default_value_t = 0.0)]
        x: f32,
        #[arg(long, default_value_t = 0.0)]
        y: f32,
        #[arg(long)]
        tile_width: f32,
        #[arg(long)]
        tile_height: f32,
        /// Pixels per point
        #[arg(long, default_value_t = 2.0)]
        scale: f32,
        #[arg(long, default_value = "balanced")]
        quality: QualityProfile,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config,
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    source: String,
    page_count: u32,
    repaired: bool,
    first_page_size_pt: Option<PageSizeOutput>,
    outline_items: usize,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

#[derive(Debug, Serialize)]
struct ScanOutput {
    file: String,
    verdict: String,
    bytes_scanned: u64,
    max_kids: usize,
    max_count: u64,
    complete: bool,
    repair: Option<String>,
}

#[derive(Debug, Serialize)]
struct RepairOutput {
    output: String,
    leaf_count: usize,
    node_count: usize,
    depth: usize,
    removed_nodes: usize,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    let mut config = ViewerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = cli.cache_dir {
        config.cache.cache_dir = dir;
    }

    match cli.command {
        Commands::Info { source } => run_info(config, &source),
        Commands::Scan { file } => run_scan(&config, &file),
        Commands::Repair { file, output } => run_repair(&config, &file, output.as_deref()),
        Commands::Render {
            source,
            page,
            width,
            quality,
            output,
        } => run_render(config, &source, page, width, quality, output.as_deref()),
        Commands::Tile {
            source,
            page,
            x,
            y,
            tile_width,
            tile_height,
            scale,
            quality,
            output,
        } => {
            let rect = ClipRect {
                x,
                y,
                width: tile_width,
                height: tile_height,
            };
            run_tile(config, &source, page, rect, scale, quality, output.as_deref())
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests calling `run` repeatedly) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_engine() -> Arc<dyn PdfEngine> {
    #[cfg(feature = "pdfium")]
    match quire_engine::pdfium_backend::PdfiumEngine::from_system_library() {
        Ok(engine) => return Arc::new(engine),
        Err(err) => tracing::warn!(%err, "PDFium unavailable; using the lopdf engine"),
    }
    Arc::new(default_engine_without_pdfium())
}

fn open(config: ViewerConfig, source: &str) -> Result<RenderPipeline> {
    let locator = Locator::parse(source);
    if let Locator::File(path) = &locator {
        ensure_pdf_exists(path)?;
    }

    let sessions = Arc::new(SessionManager::new(config, default_engine())?);
    sessions
        .open(&locator, None)
        .with_context(|| format!("failed to open PDF {locator}"))?;
    Ok(RenderPipeline::new(sessions))
}

fn run_info(config: ViewerConfig, source: &str) -> Result<()> {
    let pipeline = open(config, source)?;
    let sessions = pipeline.sessions();
    let session = sessions.current().context("no document is open")?;

    let payload = InfoOutput {
        source: session.locator().to_string(),
        page_count: session.page_count(),
        repaired: session.is_repaired(),
        first_page_size_pt: session.page_size(0).map(|size| PageSizeOutput {
            width: size.width_pt,
            height: size.height_pt,
        }),
        outline_items: sessions.subscribe_outline().borrow().len(),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    sessions.close();
    Ok(())
}

fn run_scan(config: &ViewerConfig, file: &Path) -> Result<()> {
    ensure_pdf_exists(file)?;
    let report = scan_path(file, &config.repair, &CancellationToken::new())
        .context("failed to scan PDF")?;
    let matcher = SuspectMatcher::new(&config.repair)?;
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size = fs::metadata(file).ok().map(|meta| meta.len());

    let verdict = match report.verdict {
        ScanVerdict::Healthy => "healthy".to_owned(),
        ScanVerdict::Oversized(reason) => format!("oversized: {reason}"),
        ScanVerdict::Inconclusive => "inconclusive".to_owned(),
    };
    let payload = ScanOutput {
        file: file.display().to_string(),
        verdict,
        bytes_scanned: report.bytes_scanned,
        max_kids: report.max_kids,
        max_count: report.max_count,
        complete: report.complete,
        repair: repair_trigger(&report, &name, size, &matcher).map(|trigger| trigger.to_string()),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_repair(config: &ViewerConfig, file: &Path, output: Option<&Path>) -> Result<()> {
    ensure_pdf_exists(file)?;
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let (repaired, report) = repair_bytes(&bytes, &config.repair, &CancellationToken::new())
        .context("failed to repair PDF")?;

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| sibling_output(file, "repaired", "pdf"));
    write_output(&output, |path| Ok(fs::write(path, &repaired)?))?;

    let payload = RepairOutput {
        output: output.display().to_string(),
        leaf_count: report.leaf_count,
        node_count: report.node_count,
        depth: report.depth,
        removed_nodes: report.removed_nodes,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_render(
    config: ViewerConfig,
    source: &str,
    page: u32,
    width: u32,
    quality: QualityProfile,
    output: Option<&Path>,
) -> Result<()> {
    let page_index = page_index(page)?;
    let pipeline = open(config, source)?;

    let bitmap = pipeline
        .render_page(page_index, width, quality)
        .context("failed to render page")?
        .context("render skipped")?;

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| sibling_output(Path::new(source), &format!("page-{page}"), "png"));
    write_output(&output, |path| save_png(&bitmap, path))?;
    println!("{}", output.display());

    pipeline.sessions().close();
    Ok(())
}

fn run_tile(
    config: ViewerConfig,
    source: &str,
    page: u32,
    rect: ClipRect,
    scale: f32,
    quality: QualityProfile,
    output: Option<&Path>,
) -> Result<()> {
    let page_index = page_index(page)?;
    let pipeline = open(config, source)?;

    let bitmap = pipeline
        .render_tile(page_index, rect, scale, quality)
        .context("failed to render tile")?
        .context("render skipped")?;

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| sibling_output(Path::new(source), &format!("page-{page}-tile"), "png"));
    write_output(&output, |path| save_png(&bitmap, path))?;
    println!("{}", output.display());

    pipeline.sessions().close();
    Ok(())
}

fn page_index(page: u32) -> Result<u32> {
    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }
    Ok(page - 1)
}

fn save_png(bitmap: &Bitmap, path: &Path) -> Result<()> {
    let image = image::RgbaImage::from_raw(bitmap.width(), bitmap.height(), bitmap.to_rgba8())
        .context("bitmap size does not match its pixels")?;
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

fn write_output(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write(path).with_context(|| format!("failed to write {}", path.display()))
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn sibling_output(file: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or("document");

    file.with_file_name(format!("{stem}-{suffix}.{extension}"))
}
