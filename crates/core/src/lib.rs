//! Quire viewer core
//!
//! Session lifecycle and the render pipeline of the document viewer:
//!
//! - [`SessionManager`]: validates and opens documents, repairing degenerate
//!   page trees first, and owns the single live [`Session`]
//! - [`RenderPipeline`]: supervised page, tile and thumbnail renders through
//!   the tiered bitmap cache, with per-page malformed latching
//!
//! Every open and render runs under a watchdog and must be called from a
//! background thread.

pub mod config;
pub mod error;
pub mod geometry;
pub mod malformed;
mod progress;
pub mod render;
pub mod session;
pub mod source;
pub mod telemetry;

pub use config::{RenderConfig, SessionConfig, ViewerConfig};
pub use error::{OpenError, RenderError, SetupError, SizeSuggestion};
pub use geometry::{plan_page, plan_tile, PagePlan, TilePlan, TileRaster};
pub use malformed::{FailureKind, MalformedHeuristic, PageHealth};
pub use progress::RenderProgress;
pub use render::{PrefetchReport, RenderMode, RenderPipeline};
pub use session::{Session, SessionManager};
pub use source::{
    has_pdf_signature, ByteSource, ContentResolver, Locator, RemoteStore, ResolvedSource,
    SourceResolver,
};
pub use telemetry::{Metadata, RenderCost, TelemetrySink, TracingTelemetry};
