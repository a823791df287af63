//! Completeness reconciliation for candela.
//!
//! The live stream drops candles whenever connectivity falters; this crate
//! finds the holes and repairs them from the historical API:
//!
//! - [`find_gaps`] / [`GapInterval`] - Expected-timestamp comparison
//! - [`ReconcileEngine`] - Per-gap fetch, write, verify
//! - [`RunReport`] / [`SymbolReport`] - What a run found and fixed

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod engine;
mod gaps;
mod report;

pub use engine::{ReconcileConfig, ReconcileEngine};
pub use gaps::{find_gaps, GapInterval};
pub use report::{RunReport, SymbolReport};
