//! Page-tree repair for malformed documents
//!
//! Some producers emit page trees with thousands of page references under a
//! single node. Renderers walk those linearly on every page lookup, which turns
//! opening and paging into quadratic work. This crate detects such trees with a
//! bounded streaming [`scan`] and rebuilds them into a balanced N-ary tree
//! ([`rebuild_page_tree`]). [`RepairStore`] persists the result so a source is
//! only repaired once.

mod config;
mod error;
mod rebuild;
mod scan;
mod store;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use config::RepairConfig;
pub use error::RepairError;
pub use rebuild::{inspect_tree, rebuild_page_tree, repair_bytes, RebuildReport, TreeShape};
pub use scan::{
    repair_trigger, scan, scan_path, OversizeReason, RepairTrigger, ScanReport, ScanVerdict,
    SuspectMatcher,
};
pub use store::{RepairOutcome, RepairStore};
