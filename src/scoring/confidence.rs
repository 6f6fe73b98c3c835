// =============================================================================
// Confidence Composer
// =============================================================================
//
// overall = Σ wᵢ·sᵢ / Σ wᵢ over four sub-confidences:
//   signal_agreement         1 - conflicts / active          (0 if no active)
//   historical_stability     1 - bias flips / N
//   data_quality             upstream data completeness
//   statistical_significance mean per-signal confidence of active signals
//
// No active signal forces overall confidence to 0.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::baseline::stats::round_half_even;
use crate::runtime_config::ConfidenceWeights;
use crate::signals::SignalEvaluation;
use crate::types::Bias;

const CONFIDENCE_DECIMALS: u32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubConfidences {
    pub signal_agreement: f64,
    pub historical_stability: f64,
    pub data_quality: f64,
    pub statistical_significance: f64,
}

// =============================================================================
// BiasHistory
// =============================================================================

/// Biases of the most recent results of one stream, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasHistory {
    window: usize,
    recent: VecDeque<Bias>,
}

impl BiasHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn push(&mut self, bias: Bias) {
        self.recent.push_back(bias);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// `1 - flips / N` over the stored biases followed by `current`.
    pub fn stability_with(&self, current: Bias) -> f64 {
        let flips = self
            .recent
            .iter()
            .chain(std::iter::once(&current))
            .collect::<Vec<_>>()
            .windows(2)
            .filter(|w| w[0] != w[1])
            .count();
        (1.0 - flips as f64 / self.window as f64).clamp(0.0, 1.0)
    }
}

// =============================================================================
// ConfidenceComposer
// =============================================================================

pub struct ConfidenceComposer {
    weights: ConfidenceWeights,
}

impl ConfidenceComposer {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    pub fn sub_confidences(
        &self,
        active: &[SignalEvaluation],
        conflicting_signal_count: usize,
        historical_stability: f64,
        data_completeness: f64,
    ) -> SubConfidences {
        let n = active.len();
        let signal_agreement = if n == 0 {
            0.0
        } else {
            (1.0 - conflicting_signal_count as f64 / n as f64).clamp(0.0, 1.0)
        };
        let statistical_significance = if n == 0 {
            0.0
        } else {
            active.iter().map(|e| e.confidence).sum::<f64>() / n as f64
        };
        SubConfidences {
            signal_agreement: round_half_even(signal_agreement, CONFIDENCE_DECIMALS),
            historical_stability: round_half_even(
                historical_stability.clamp(0.0, 1.0),
                CONFIDENCE_DECIMALS,
            ),
            data_quality: round_half_even(data_completeness.clamp(0.0, 1.0), CONFIDENCE_DECIMALS),
            statistical_significance: round_half_even(
                statistical_significance.clamp(0.0, 1.0),
                CONFIDENCE_DECIMALS,
            ),
        }
    }

    /// Weighted mean of the sub-confidences; 0 when there are no active
    /// signals.
    pub fn overall(&self, sub: &SubConfidences, active_signal_count: usize) -> f64 {
        if active_signal_count == 0 {
            return 0.0;
        }
        let w = &self.weights;
        let total = w.sum();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = w.signal_agreement * sub.signal_agreement
            + w.historical_stability * sub.historical_stability
            + w.data_quality * sub.data_quality
            + w.statistical_significance * sub.statistical_significance;
        round_half_even((weighted / total).clamp(0.0, 1.0), CONFIDENCE_DECIMALS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn history_counts_flips_over_window() {
        let mut h = BiasHistory::new(10);
        assert_eq!(h.stability_with(Bias::Positive), 1.0);
        for b in [Bias::Positive, Bias::Negative, Bias::Positive] {
            h.push(b);
        }
        // P N P + N -> 3 flips
        assert!((h.stability_with(Bias::Negative) - 0.7).abs() < 1e-12);
        assert!((h.stability_with(Bias::Positive) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn history_is_bounded() {
        let mut h = BiasHistory::new(3);
        for _ in 0..10 {
            h.push(Bias::Neutral);
        }
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn no_active_signals_means_zero_confidence() {
        let c = ConfidenceComposer::new(ConfidenceWeights::default());
        let sub = c.sub_confidences(&[], 0, 1.0, 1.0);
        assert_eq!(sub.signal_agreement, 0.0);
        assert_eq!(c.overall(&sub, 0), 0.0);
    }

    #[test]
    fn equal_weights_give_plain_mean() {
        let c = ConfidenceComposer::new(ConfidenceWeights::default());
        let sub = SubConfidences {
            signal_agreement: 1.0,
            historical_stability: 0.8,
            data_quality: 0.6,
            statistical_significance: 0.4,
        };
        assert_eq!(c.overall(&sub, 5), 0.7);
    }

    #[test]
    fn weights_are_normalised_by_sum() {
        let c = ConfidenceComposer::new(ConfidenceWeights {
            signal_agreement: 2.0,
            historical_stability: 0.0,
            data_quality: 2.0,
            statistical_significance: 0.0,
        });
        let sub = SubConfidences {
            signal_agreement: 1.0,
            historical_stability: 0.0,
            data_quality: 0.5,
            statistical_significance: 0.0,
        };
        assert_eq!(c.overall(&sub, 1), 0.75);
    }

    proptest! {
        #[test]
        fn overall_confidence_is_bounded(
            a in 0.0f64..=1.0,
            h in 0.0f64..=1.0,
            d in -1.0f64..=2.0,
            s in 0.0f64..=1.0,
            w in proptest::collection::vec(0.0f64..5.0, 4),
            active in 0usize..20,
        ) {
            prop_assume!(w.iter().sum::<f64>() > 0.0);
            let c = ConfidenceComposer::new(ConfidenceWeights {
                signal_agreement: w[0],
                historical_stability: w[1],
                data_quality: w[2],
                statistical_significance: w[3],
            });
            let sub = SubConfidences {
                signal_agreement: a,
                historical_stability: h,
                data_quality: d.clamp(0.0, 1.0),
                statistical_significance: s,
            };
            let overall = c.overall(&sub, active);
            prop_assert!((0.0..=1.0).contains(&overall));
            if active == 0 {
                prop_assert_eq!(overall, 0.0);
            }
        }
    }
}
