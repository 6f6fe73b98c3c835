// =============================================================================
// Score Aggregator — evaluations → category points, overall score, bias
// =============================================================================
//
//   category = cap · min(1, Σ wᵢ·vᵢ / Σ w_configured)
//   overall  = clamp(network + capital + smart_money − risk_penalty, 0, 100)
//
// vᵢ is 1/0 for boolean signals and the intensity for continuous ones.
// Σ w_configured runs over every configured definition of the category, so
// an omitted signal contributes zero rather than re-weighting the others.
// Scores are banker's-rounded to two places.
// =============================================================================

use std::collections::HashMap;

use crate::baseline::stats::round_half_even;
use crate::decision_envelope::{ComponentScores, NEUTRAL_SCORE};
use crate::runtime_config::{BiasThresholds, CategoryCaps};
use crate::signals::{SignalDefinition, SignalEvaluation};
use crate::types::{Bias, SignalCategory, SignalDirection};

const SCORE_DECIMALS: u32 = 2;
const STABILITY_DECIMALS: u32 = 4;

/// Everything the aggregator derives from one evaluation set.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub overall_score: f64,
    pub bias: Bias,
    pub component_scores: ComponentScores,
    pub active_signal_count: usize,
    pub conflicting_signal_count: usize,
    pub stability_score: f64,
}

/// Pure function of score: no hysteresis.
pub fn classify_bias(score: f64, thresholds: &BiasThresholds) -> Bias {
    if score > thresholds.positive_above {
        Bias::Positive
    } else if score < thresholds.negative_below {
        Bias::Negative
    } else {
        Bias::Neutral
    }
}

/// Fired accumulation × fired distribution boolean signals, per category.
pub fn count_conflicts(evaluations: &[SignalEvaluation]) -> usize {
    let mut tally: HashMap<SignalCategory, (usize, usize)> = HashMap::new();
    for e in evaluations.iter().filter(|e| e.value.is_true()) {
        let entry = tally.entry(e.category).or_default();
        match e.direction {
            SignalDirection::Accumulation => entry.0 += 1,
            SignalDirection::Distribution => entry.1 += 1,
            SignalDirection::Neutral => {}
        }
    }
    tally.values().map(|(acc, dist)| acc * dist).sum()
}

pub struct ScoreAggregator<'a> {
    caps: &'a CategoryCaps,
    bias: &'a BiasThresholds,
    configured_weight: HashMap<SignalCategory, f64>,
}

impl<'a> ScoreAggregator<'a> {
    pub fn new(
        caps: &'a CategoryCaps,
        bias: &'a BiasThresholds,
        definitions: &[SignalDefinition],
    ) -> Self {
        let mut configured_weight = HashMap::new();
        for def in definitions {
            *configured_weight.entry(def.category).or_insert(0.0) += def.component_weight;
        }
        Self {
            caps,
            bias,
            configured_weight,
        }
    }

    /// Points for one category, before rounding.
    fn category_points(&self, category: SignalCategory, evaluations: &[SignalEvaluation]) -> f64 {
        let configured = self.configured_weight.get(&category).copied().unwrap_or(0.0);
        if configured <= 0.0 {
            return 0.0;
        }
        let raw: f64 = evaluations
            .iter()
            .filter(|e| e.category == category)
            .map(|e| e.component_weight * e.value.contribution())
            .sum();
        self.caps.cap(category) * (raw / configured).clamp(0.0, 1.0)
    }

    pub fn aggregate(&self, evaluations: &[SignalEvaluation]) -> Aggregation {
        let active_signal_count = evaluations.len();
        let conflicting_signal_count = count_conflicts(evaluations);

        if active_signal_count == 0 {
            return Aggregation {
                overall_score: NEUTRAL_SCORE,
                bias: Bias::Neutral,
                component_scores: ComponentScores::default(),
                active_signal_count,
                conflicting_signal_count,
                stability_score: 0.0,
            };
        }

        let points = |c| round_half_even(self.category_points(c, evaluations), SCORE_DECIMALS);
        let component_scores = ComponentScores {
            network_health: points(SignalCategory::NetworkHealth),
            capital_flow: points(SignalCategory::CapitalFlow),
            smart_money: points(SignalCategory::SmartMoney),
            risk_penalty: points(SignalCategory::Risk),
        };

        let positive = component_scores.network_health
            + component_scores.capital_flow
            + component_scores.smart_money;
        let overall_score = round_half_even(
            (positive - component_scores.risk_penalty).clamp(0.0, 100.0),
            SCORE_DECIMALS,
        );

        let stability_score = round_half_even(
            evaluations.iter().map(|e| e.baseline_stability).sum::<f64>()
                / active_signal_count as f64,
            STABILITY_DECIMALS,
        );

        Aggregation {
            overall_score,
            bias: classify_bias(overall_score, self.bias),
            component_scores,
            active_signal_count,
            conflicting_signal_count,
            stability_score,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
