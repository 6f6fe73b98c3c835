// =============================================================================
// Baseline Module
// =============================================================================
//
// Rolling statistical reference frames for signal evaluation:
// - Deterministic order statistics
// - Snapshot table keyed by (signal, metric, asset, timeframe, as-of)
// - Read-through cache with TTL and explicit bust

pub mod cache;
pub mod stats;
pub mod store;

pub use cache::BaselineCache;
pub use store::{Baseline, BaselineSet, BaselineStore};
