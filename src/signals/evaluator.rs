// =============================================================================
// Signal Evaluator — definitions × metrics × baselines → evaluations
// =============================================================================
//
// One evaluation per definition per cycle. A missing metric omits the signal
// from the cycle; an insufficient baseline still yields a best-effort value
// with zero confidence.
//
//   confidence   = stability * adequacy * margin_factor
//   adequacy     = min(1, sample_size / lookback)    (0 when insufficient)
//   margin_factor = m / (m + half_saturation)
//
// where m is the smallest standardised distance between an observed value
// and any decision threshold of the signal.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::hashing::canonical_hash;
use crate::baseline::stats::round_half_even;
use crate::baseline::{Baseline, BaselineSet};
use crate::errors::EngineError;
use crate::runtime_config::EvaluatorSettings;
use crate::signals::definition::{Condition, Predicate, SignalDefinition, SignalRule};
use crate::types::{ScoreKey, SignalCategory, SignalDirection, Timeframe, ValueKind};

const CONFIDENCE_DECIMALS: u32 = 4;

/// Value produced by a signal in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Boolean(bool),
    Continuous(f64),
}

impl SignalValue {
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Continuous(_) => ValueKind::Continuous,
        }
    }

    /// Contribution to the category sum: 1/0 for booleans, the intensity
    /// for continuous signals.
    pub fn contribution(self) -> f64 {
        match self {
            Self::Boolean(true) => 1.0,
            Self::Boolean(false) => 0.0,
            Self::Continuous(v) => v,
        }
    }

    /// A boolean signal that fired.
    pub fn is_true(self) -> bool {
        matches!(self, Self::Boolean(true))
    }
}

/// Result of evaluating one signal for one cycle. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvaluation {
    pub signal_id: String,
    pub signal_version: u32,
    pub category: SignalCategory,
    pub direction: SignalDirection,
    pub component_weight: f64,

    pub asset: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,

    pub value: SignalValue,
    pub confidence: f64,
    /// Conditions holding, for boolean signals.
    pub conditions_met: Option<usize>,

    /// Minimum stability across the baselines the signal referenced.
    pub baseline_stability: f64,
    pub baseline_sample_size: usize,
    pub insufficient_baseline: bool,
    pub regime_change_detected: bool,

    pub input_data_hash: String,
    /// Wall-clock time of evaluation; not part of any hash.
    pub calculation_time: DateTime<Utc>,
}

/// Evaluations of one cycle plus the signals that could not be evaluated.
#[derive(Debug, Clone, Default)]
pub struct EvaluationBatch {
    pub evaluations: Vec<SignalEvaluation>,
    /// `MissingMetricInput` for each omitted signal.
    pub omitted: Vec<EngineError>,
}

impl EvaluationBatch {
    /// Per-signal data-quality problems: omissions and insufficient
    /// baselines.
    pub fn data_quality_issues(&self, min_sample: usize) -> Vec<EngineError> {
        let mut out = self.omitted.clone();
        for e in self.evaluations.iter().filter(|e| e.insufficient_baseline) {
            out.push(EngineError::InsufficientBaselineData {
                signal_id: e.signal_id.clone(),
                metric: "*".into(),
                sample_size: e.baseline_sample_size,
                minimum: min_sample,
            });
        }
        out
    }
}

#[derive(Serialize)]
struct EvaluationInputs<'a> {
    signal_id: &'a str,
    signal_version: u32,
    key: &'a ScoreKey,
    thresholds: BTreeMap<String, f64>,
    metrics: BTreeMap<&'a str, f64>,
    baselines: BTreeMap<&'a str, Option<DateTime<Utc>>>,
}

/// Aggregated view over the baselines one signal references.
struct SignalBaselines<'a> {
    by_metric: BTreeMap<&'a str, Option<&'a Baseline>>,
    stability: f64,
    sample_size: usize,
    insufficient: bool,
    regime_change: bool,
}

impl<'a> SignalBaselines<'a> {
    fn resolve(def: &SignalDefinition, metrics: &'a [String], set: &'a BaselineSet) -> Self {
        let by_metric: BTreeMap<&str, Option<&Baseline>> = metrics
            .iter()
            .map(|m| (m.as_str(), set.get(&def.id, m)))
            .collect();

        let present: Vec<&Baseline> = by_metric.values().flatten().copied().collect();
        let all_present = present.len() == by_metric.len();

        Self {
            stability: if all_present {
                present.iter().map(|b| b.stability_score).fold(1.0, f64::min)
            } else {
                0.0
            },
            sample_size: if all_present {
                present.iter().map(|b| b.sample_size).min().unwrap_or(0)
            } else {
                0
            },
            insufficient: !all_present || present.iter().any(|b| b.insufficient),
            regime_change: present.iter().any(|b| b.regime_change_detected),
            by_metric,
        }
    }

    fn get(&self, metric: &str) -> Option<&'a Baseline> {
        self.by_metric.get(metric).copied().flatten()
    }
}

/// Outcome of one condition.
struct ConditionOutcome {
    holds: bool,
    /// Standardised distance from the nearest threshold.
    margin: f64,
}

fn standardised(distance: f64, baseline: &Baseline) -> f64 {
    if baseline.std_dev > f64::EPSILON {
        distance / baseline.std_dev
    } else if distance > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

fn relative(x: f64, threshold: f64) -> f64 {
    let distance = (x - threshold).abs();
    if threshold.abs() > f64::EPSILON {
        distance / threshold.abs()
    } else {
        distance
    }
}

/// Single dispatch over the predicate variants.
fn evaluate_condition(condition: &Condition, x: f64, baseline: Option<&Baseline>) -> ConditionOutcome {
    let unknown = ConditionOutcome {
        holds: false,
        margin: 0.0,
    };
    match condition.predicate {
        Predicate::AbovePercentile { percentile } | Predicate::BelowPercentile { percentile } => {
            let Some(b) = baseline else { return unknown };
            let Some(threshold) = b.threshold_at(percentile) else {
                return unknown;
            };
            let holds = match condition.predicate {
                Predicate::AbovePercentile { .. } => x > threshold,
                _ => x < threshold,
            };
            ConditionOutcome {
                holds,
                margin: standardised((x - threshold).abs(), b),
            }
        }
        Predicate::OutsidePercentileBand { lower, upper } => {
            let Some(b) = baseline else { return unknown };
            let (Some(lo), Some(hi)) = (b.threshold_at(lower), b.threshold_at(upper)) else {
                return unknown;
            };
            let nearest = (x - lo).abs().min((x - hi).abs());
            ConditionOutcome {
                holds: x < lo || x > hi,
                margin: standardised(nearest, b),
            }
        }
        Predicate::AboveRatio { threshold } => ConditionOutcome {
            holds: x > threshold,
            margin: relative(x, threshold),
        },
        Predicate::BelowRatio { threshold } => ConditionOutcome {
            holds: x < threshold,
            margin: relative(x, threshold),
        },
        Predicate::ZScoreBeyond { threshold } => {
            let Some(z) = baseline.and_then(|b| b.z_score(x)) else {
                return unknown;
            };
            ConditionOutcome {
                holds: z.abs() > threshold,
                margin: (z.abs() - threshold).abs(),
            }
        }
    }
}

/// Min-max intensity against the ladder extremes, clamped to [0, 1].
fn intensity(x: f64, baseline: Option<&Baseline>, invert: bool) -> f64 {
    let Some((lo, hi)) = baseline.and_then(Baseline::ladder_bounds) else {
        return 0.0;
    };
    let v = if hi - lo > f64::EPSILON {
        ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    if invert {
        1.0 - v
    } else {
        v
    }
}

pub struct SignalEvaluator {
    settings: EvaluatorSettings,
}

impl SignalEvaluator {
    pub fn new(settings: EvaluatorSettings) -> Self {
        Self { settings }
    }

    fn margin_factor(&self, margin: f64) -> f64 {
        if margin.is_infinite() {
            return 1.0;
        }
        let m = margin.max(0.0);
        m / (m + self.settings.margin_half_saturation)
    }

    /// Evaluate one definition. Fails only with `MissingMetricInput`.
    pub fn evaluate(
        &self,
        def: &SignalDefinition,
        key: &ScoreKey,
        metrics: &BTreeMap<String, f64>,
        baselines: &BaselineSet,
    ) -> Result<SignalEvaluation, EngineError> {
        let names = def.metrics();
        let mut inputs = BTreeMap::new();
        for name in &names {
            match metrics.get(name) {
                Some(v) if v.is_finite() => {
                    inputs.insert(name.as_str(), *v);
                }
                _ => {
                    return Err(EngineError::MissingMetricInput {
                        signal_id: def.id.clone(),
                        metric: name.clone(),
                    })
                }
            }
        }

        let refs = SignalBaselines::resolve(def, &names, baselines);

        let (value, conditions_met, margin) = match &def.rule {
            SignalRule::Boolean { conditions, quorum } => {
                let mut holding = 0;
                let mut margin = f64::INFINITY;
                for c in conditions {
                    let x = inputs.get(c.metric.as_str()).copied().unwrap_or_default();
                    let outcome = evaluate_condition(c, x, refs.get(&c.metric));
                    if outcome.holds {
                        holding += 1;
                    }
                    margin = margin.min(outcome.margin);
                }
                (
                    SignalValue::Boolean(quorum.is_met(holding)),
                    Some(holding),
                    margin,
                )
            }
            SignalRule::Continuous { metric, invert } => {
                let x = inputs.get(metric.as_str()).copied().unwrap_or_default();
                let v = round_half_even(intensity(x, refs.get(metric), *invert), 8);
                // no decision threshold to sit near
                (SignalValue::Continuous(v), None, f64::INFINITY)
            }
        };
        debug_assert_eq!(value.kind(), def.value_kind());

        let adequacy = if refs.insufficient {
            0.0
        } else {
            (refs.sample_size as f64 / def.baseline_lookback_periods as f64).min(1.0)
        };
        let confidence = round_half_even(
            (refs.stability * adequacy * self.margin_factor(margin)).clamp(0.0, 1.0),
            CONFIDENCE_DECIMALS,
        );

        let input_data_hash = canonical_hash(&EvaluationInputs {
            signal_id: &def.id,
            signal_version: def.version,
            key,
            thresholds: def.threshold_parameters(),
            metrics: inputs,
            baselines: refs
                .by_metric
                .iter()
                .map(|(m, b)| (*m, b.map(|b| b.as_of)))
                .collect(),
        });

        Ok(SignalEvaluation {
            signal_id: def.id.clone(),
            signal_version: def.version,
            category: def.category,
            direction: def.direction,
            component_weight: def.component_weight,
            asset: key.asset.clone(),
            timeframe: key.timeframe,
            timestamp: key.timestamp,
            value,
            confidence,
            conditions_met,
            baseline_stability: refs.stability,
            baseline_sample_size: refs.sample_size,
            insufficient_baseline: refs.insufficient,
            regime_change_detected: refs.regime_change,
            input_data_hash,
            calculation_time: Utc::now(),
        })
    }

    /// Evaluate every definition, separating omitted signals.
    pub fn evaluate_all(
        &self,
        definitions: &[SignalDefinition],
        key: &ScoreKey,
        metrics: &BTreeMap<String, f64>,
        baselines: &BaselineSet,
    ) -> EvaluationBatch {
        let mut batch = EvaluationBatch::default();
        for def in definitions {
            match self.evaluate(def, key, metrics, baselines) {
                Ok(evaluation) => batch.evaluations.push(evaluation),
                Err(e) => {
                    debug!(key = %key, signal = %def.id, error = %e, "signal omitted");
                    batch.omitted.push(e);
                }
            }
        }
        batch
    }
}

impl Default for SignalEvaluator {
    fn default() -> Self {
        Self::new(EvaluatorSettings::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::BaselineSettings;
    use crate::signals::catalog::default_signals;
    use chrono::TimeZone;

    fn key() -> ScoreKey {
        ScoreKey::new("BTC", Timeframe::D1, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    }

    fn def(id: &str) -> SignalDefinition {
        default_signals().into_iter().find(|d| d.id == id).unwrap()
    }

    /// Baselines over 1..=90 for every metric of `def`.
    fn baselines_for(def: &SignalDefinition, n: usize) -> BaselineSet {
        let history: Vec<f64> = (1..=n).map(|i| i as f64).collect();
        let mut set = BaselineSet::default();
        for m in def.metrics() {
            set.insert(Baseline::compute(
                &def.id,
                &m,
                "BTC",
                Timeframe::D1,
                key().timestamp,
                &history,
                def.baseline_lookback_periods,
                &BaselineSettings::default(),
            ));
        }
        set
    }

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn quorum_two_of_three_fires() {
        let d = def("network_growth_signal");
        let set = baselines_for(&d, 90);
        let m = metrics(&[("active_addresses", 200.0), ("tx_count", 200.0), ("new_addresses", 1.0)]);
        let e = SignalEvaluator::default().evaluate(&d, &key(), &m, &set).unwrap();
        assert_eq!(e.value, SignalValue::Boolean(true));
        assert_eq!(e.conditions_met, Some(2));
        assert!(e.confidence > 0.0 && e.confidence <= 1.0);
        assert!(!e.insufficient_baseline);
    }

    #[test]
    fn quorum_not_met_is_false() {
        let d = def("network_growth_signal");
        let set = baselines_for(&d, 90);
        let m = metrics(&[("active_addresses", 200.0), ("tx_count", 1.0), ("new_addresses", 1.0)]);
        let e = SignalEvaluator::default().evaluate(&d, &key(), &m, &set).unwrap();
        assert_eq!(e.value, SignalValue::Boolean(false));
        assert_eq!(e.conditions_met, Some(1));
    }

    #[test]
    fn missing_metric_omits_signal() {
        let d = def("network_growth_signal");
        let set = baselines_for(&d, 90);
        let m = metrics(&[("active_addresses", 200.0), ("tx_count", 200.0)]);
        let err = SignalEvaluator::default().evaluate(&d, &key(), &m, &set).unwrap_err();
        assert!(matches!(err, EngineError::MissingMetricInput { ref metric, .. } if metric == "new_addresses"));
    }

    #[test]
    fn non_finite_metric_counts_as_missing() {
        let d = def("capital_concentration_signal");
        let set = baselines_for(&d, 90);
        let m = metrics(&[("gini_concentration", f64::NAN)]);
        assert!(SignalEvaluator::default().evaluate(&d, &key(), &m, &set).is_err());
    }

    #[test]
    fn insufficient_baseline_keeps_value_with_zero_confidence() {
        let d = def("network_growth_signal");
        let set = baselines_for(&d, 10);
        let m = metrics(&[("active_addresses", 200.0), ("tx_count", 200.0), ("new_addresses", 200.0)]);
        let e = SignalEvaluator::default().evaluate(&d, &key(), &m, &set).unwrap();
        assert!(e.insufficient_baseline);
        assert_eq!(e.confidence, 0.0);
        // best effort: the thresholds from the thin sample still apply
        assert_eq!(e.value, SignalValue::Boolean(true));
    }

    #[test]
    fn absent_baseline_is_insufficient() {
        let d = def("capital_concentration_signal");
        let m = metrics(&[("gini_concentration", 0.7)]);
        let e = SignalEvaluator::default()
            .evaluate(&d, &key(), &m, &BaselineSet::default())
            .unwrap();
        assert!(e.insufficient_baseline);
        assert_eq!(e.value, SignalValue::Continuous(0.0));
        assert_eq!(e.confidence, 0.0);
    }

    #[test]
    fn continuous_intensity_is_min_max_and_clamped() {
        let d = def("capital_concentration_signal");
        let set = baselines_for(&d, 90);
        let b = set.get(&d.id, "gini_concentration").unwrap();
        let (lo, hi) = b.ladder_bounds().unwrap();
        let mid = (lo + hi) / 2.0;
        let ev = SignalEvaluator::default();

        let e = ev.evaluate(&d, &key(), &metrics(&[("gini_concentration", mid)]), &set).unwrap();
        assert_eq!(e.value, SignalValue::Continuous(0.5));

        let e = ev.evaluate(&d, &key(), &metrics(&[("gini_concentration", hi * 10.0)]), &set).unwrap();
        assert_eq!(e.value, SignalValue::Continuous(1.0));

        let e = ev.evaluate(&d, &key(), &metrics(&[("gini_concentration", -5.0)]), &set).unwrap();
        assert_eq!(e.value, SignalValue::Continuous(0.0));
    }

    #[test]
    fn value_near_threshold_has_lower_confidence() {
        let d = def("whale_flow_dominance_signal");
        let set = baselines_for(&d, 90);
        let ev = SignalEvaluator::default();
        let near = ev
            .evaluate(&d, &key(), &metrics(&[("whale_volume_share", 0.41), ("whale_count_share", 0.5)]), &set)
            .unwrap();
        let far = ev
            .evaluate(&d, &key(), &metrics(&[("whale_volume_share", 0.9), ("whale_count_share", 0.5)]), &set)
            .unwrap();
        assert!(near.confidence < far.confidence);
    }

    #[test]
    fn input_hash_is_stable_and_input_sensitive() {
        let d = def("network_growth_signal");
        let set = baselines_for(&d, 90);
        let ev = SignalEvaluator::default();
        let m = metrics(&[("active_addresses", 200.0), ("tx_count", 200.0), ("new_addresses", 1.0)]);
        let a = ev.evaluate(&d, &key(), &m, &set).unwrap();
        let b = ev.evaluate(&d, &key(), &m, &set).unwrap();
        assert_eq!(a.input_data_hash, b.input_data_hash);

        let m2 = metrics(&[("active_addresses", 201.0), ("tx_count", 200.0), ("new_addresses", 1.0)]);
        let c = ev.evaluate(&d, &key(), &m2, &set).unwrap();
        assert_ne!(a.input_data_hash, c.input_data_hash);
    }

    #[test]
    fn evaluate_all_separates_omitted() {
        let defs = default_signals();
        let m = metrics(&[("gini_concentration", 0.5)]);
        let batch = SignalEvaluator::default().evaluate_all(&defs, &key(), &m, &BaselineSet::default());
        assert_eq!(batch.evaluations.len(), 1);
        assert_eq!(batch.omitted.len(), 7);
        assert_eq!(batch.data_quality_issues(30).len(), 8);
    }
}
