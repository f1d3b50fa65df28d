//! Test pyramid runner (smoke/fast/normal/full) with baseline comparison,
//! and the per-agent regression tracker built on top of it.

pub mod gate;
pub mod regression;

pub use gate::{capture_baseline, format_compact, run_test_level, GateError};
pub use regression::RegressionTracker;
