//! Telemetry seam
//!
//! Breadcrumbs are short strings describing what the core did; non-fatal
//! records carry an error plus a metadata map. Neither may fail the caller.

use std::collections::BTreeMap;
use std::error::Error;
use tracing::{info, warn};

pub type Metadata = BTreeMap<String, String>;

/// Build a metadata map from `(key, value)` pairs
pub fn metadata<const N: usize>(pairs: [(&str, String); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// Estimated cost of one render attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCost {
    pub kind: &'static str,
    pub page_index: u32,
    pub width: u32,
    pub height: u32,
    pub estimated_bytes: usize,
    pub outcome: &'static str,
}

pub trait TelemetrySink: Send + Sync {
    fn breadcrumb(&self, message: &str);

    fn record_non_fatal(&self, error: &(dyn Error + 'static), metadata: &Metadata);

    fn render_cost(&self, cost: &RenderCost) {
        self.breadcrumb(&format!(
            "render {} page={} size={}x{} bytes={} outcome={}",
            cost.kind, cost.page_index, cost.width, cost.height, cost.estimated_bytes, cost.outcome
        ));
    }
}

/// Default sink: forwards everything to `tracing` under `quire::telemetry`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn breadcrumb(&self, message: &str) {
        info!(target: "quire::telemetry", "{message}");
    }

    fn record_non_fatal(&self, error: &(dyn Error + 'static), metadata: &Metadata) {
        warn!(target: "quire::telemetry", error = %error, ?metadata, "non-fatal error");
    }

    fn render_cost(&self, cost: &RenderCost) {
        info!(
            target: "quire::telemetry",
            kind = cost.kind,
            page = cost.page_index,
            width = cost.width,
            height = cost.height,
            bytes = cost.estimated_bytes,
            outcome = cost.outcome,
            "render cost"
        );
    }
}
