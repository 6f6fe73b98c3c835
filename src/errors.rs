// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Per-signal errors (insufficient baseline, missing metric) are absorbed by
// the cycle and turned into lowered confidence or signal omission. The
// remaining variants force the Decision Gate into BLOCKED.
// =============================================================================

use thiserror::Error;

use crate::types::ScoreKey;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("insufficient baseline data for {signal_id}/{metric}: {sample_size} samples < minimum {minimum}")]
    InsufficientBaselineData {
        signal_id: String,
        metric: String,
        sample_size: usize,
        minimum: usize,
    },

    #[error("missing metric input '{metric}' for signal {signal_id}")]
    MissingMetricInput { signal_id: String, metric: String },

    #[error("determinism violation for {key}: {first} != {second}")]
    DeterminismViolation {
        key: ScoreKey,
        first: String,
        second: String,
    },

    #[error("stale data: lag {lag_secs}s exceeds maximum {max_secs}s")]
    StaleDataError { lag_secs: u64, max_secs: u64 },

    #[error("upstream invariant check failed: {0}")]
    InvariantCheckFailed(String),

    #[error("metric source failed: {0}")]
    Source(String),

    #[error("cycle for {key} exceeded {timeout_ms}ms")]
    CycleTimeout { key: ScoreKey, timeout_ms: u64 },

    #[error("out-of-order cycle {key}: last processed {last}")]
    OutOfOrderCycle { key: ScoreKey, last: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_signal_errors_format() {
        let e = EngineError::InsufficientBaselineData {
            signal_id: "network_growth_signal".into(),
            metric: "tx_count".into(),
            sample_size: 3,
            minimum: 30,
        };
        assert_eq!(
            e.to_string(),
            "insufficient baseline data for network_growth_signal/tx_count: 3 samples < minimum 30"
        );
    }

    #[test]
    fn stale_data_formats() {
        let e = EngineError::StaleDataError {
            lag_secs: 9_000,
            max_secs: 7_200,
        };
        assert_eq!(e.to_string(), "stale data: lag 9000s exceeds maximum 7200s");
    }
}
