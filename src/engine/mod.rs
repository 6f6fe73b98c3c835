// =============================================================================
// Engine Module
// =============================================================================
//
// Orchestration around the pure scoring core:
// - MetricSource seam to the upstream pipeline
// - CycleRunner: one serialised, time-bounded cycle per stream
// - Scheduler: per-timeframe loops, baseline refresh, backfill

pub mod cycle;
pub mod scheduler;
pub mod source;

pub use cycle::CycleRunner;
pub use scheduler::{ConfigHandle, Scheduler};
pub use source::{CycleInputs, InMemoryMetricSource};
