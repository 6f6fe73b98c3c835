// =============================================================================
// Scoring Module
// =============================================================================
//
// Evaluations → ScoreResult:
// - Category aggregation, risk deduction, bias
// - Four-part confidence composition

pub mod aggregator;
pub mod confidence;

pub use confidence::BiasHistory;

use aggregator::ScoreAggregator;
use confidence::ConfidenceComposer;

use chrono::Utc;

use crate::decision_envelope::ScoreResult;
use crate::runtime_config::EngineConfig;
use crate::signals::SignalEvaluation;
use crate::types::ScoreKey;

/// Upstream quality figures and identity fed into one scoring pass.
#[derive(Debug, Clone)]
pub struct ScoringContext<'a> {
    pub key: &'a ScoreKey,
    pub data_completeness: f64,
    pub input_data_hash: &'a str,
    pub config_hash: &'a str,
    pub omitted_signals: &'a [String],
}

/// Pure scoring pass: identical inputs always produce the same
/// `calculation_hash`.
pub fn compute_score(
    config: &EngineConfig,
    ctx: &ScoringContext<'_>,
    evaluations: &[SignalEvaluation],
    history: &BiasHistory,
) -> ScoreResult {
    let aggregation =
        ScoreAggregator::new(&config.category_caps, &config.bias, &config.signals).aggregate(evaluations);

    let composer = ConfidenceComposer::new(config.confidence_weights.clone());
    let breakdown = composer.sub_confidences(
        evaluations,
        aggregation.conflicting_signal_count,
        history.stability_with(aggregation.bias),
        ctx.data_completeness,
    );
    let confidence = composer.overall(&breakdown, aggregation.active_signal_count);

    let mut result = ScoreResult {
        asset: ctx.key.asset.clone(),
        timeframe: ctx.key.timeframe,
        timestamp: ctx.key.timestamp,
        overall_score: aggregation.overall_score,
        bias: aggregation.bias,
        component_scores: aggregation.component_scores,
        confidence,
        confidence_breakdown: breakdown,
        active_signal_count: aggregation.active_signal_count,
        conflicting_signal_count: aggregation.conflicting_signal_count,
        data_completeness: breakdown.data_quality,
        stability_score: aggregation.stability_score,
        omitted_signals: ctx.omitted_signals.to_vec(),
        input_data_hash: ctx.input_data_hash.to_string(),
        config_hash: ctx.config_hash.to_string(),
        calculation_hash: String::new(),
        calculation_time: Utc::now(),
    };
    result.seal();
    result
}

#[cfg(test)]
mod tests {
    use super::aggregator::tests::eval;
    use super::*;
    use crate::signals::SignalValue;
    use crate::types::{Bias, SignalCategory, SignalDirection, Timeframe};
    use chrono::TimeZone;

    fn key() -> ScoreKey {
        ScoreKey::new("BTC", Timeframe::D1, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    }

    fn ctx(key: &ScoreKey) -> ScoringContext<'_> {
        ScoringContext {
            key,
            data_completeness: 0.95,
            input_data_hash: "inputs",
            config_hash: "cfg",
            omitted_signals: &[],
        }
    }

    #[test]
    fn identical_evaluations_hash_identically() {
        let cfg = EngineConfig::default();
        let key = key();
        let evals = vec![eval(
            "network_growth_signal",
            SignalCategory::NetworkHealth,
            SignalDirection::Accumulation,
            0.6,
            SignalValue::Boolean(true),
        )];
        let history = BiasHistory::new(cfg.historical_window);
        let a = compute_score(&cfg, &ctx(&key), &evals, &history);
        let b = compute_score(&cfg, &ctx(&key), &evals, &history);
        assert_eq!(a.calculation_hash, b.calculation_hash);
        assert!(a.verify());
    }

    #[test]
    fn no_signals_yields_neutral_zero_confidence() {
        let cfg = EngineConfig::default();
        let key = key();
        let r = compute_score(&cfg, &ctx(&key), &[], &BiasHistory::new(10));
        assert_eq!(r.overall_score, 50.0);
        assert_eq!(r.bias, Bias::Neutral);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.data_completeness, 0.95);
    }

    #[test]
    fn bias_flips_lower_confidence() {
        let cfg = EngineConfig::default();
        let key = key();
        let evals = vec![eval(
            "network_growth_signal",
            SignalCategory::NetworkHealth,
            SignalDirection::Accumulation,
            0.6,
            SignalValue::Boolean(true),
        )];
        let steady = BiasHistory::new(10);
        let mut flipping = BiasHistory::new(10);
        for b in [Bias::Positive, Bias::Negative, Bias::Positive, Bias::Neutral] {
            flipping.push(b);
        }
        let a = compute_score(&cfg, &ctx(&key), &evals, &steady);
        let b = compute_score(&cfg, &ctx(&key), &evals, &flipping);
        assert!(b.confidence < a.confidence);
        assert_ne!(a.calculation_hash, b.calculation_hash);
    }
}
