// =============================================================================
// Signal Definitions — versioned, immutable evaluation rules
// =============================================================================
//
// A definition never changes in place: editing a rule means publishing a new
// `version`. Predicates are a closed set of variants dispatched through one
// match in the evaluator, so no rule is interpreted from strings at runtime.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{SignalCategory, SignalDirection, ValueKind};

/// Comparison of a metric against its baseline or a fixed number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Metric strictly above the baseline value at `percentile`.
    AbovePercentile { percentile: f64 },
    /// Metric strictly below the baseline value at `percentile`.
    BelowPercentile { percentile: f64 },
    /// Metric outside the `[lower, upper]` percentile band.
    OutsidePercentileBand { lower: f64, upper: f64 },
    /// Metric strictly above a fixed ratio.
    AboveRatio { threshold: f64 },
    /// Metric strictly below a fixed ratio.
    BelowRatio { threshold: f64 },
    /// Absolute z-score against the baseline mean/std beyond `threshold`.
    ZScoreBeyond { threshold: f64 },
}

impl Predicate {
    /// Named numeric parameters of this predicate, prefixed by the metric.
    fn parameters(&self, metric: &str, out: &mut BTreeMap<String, f64>) {
        match self {
            Self::AbovePercentile { percentile } => {
                out.insert(format!("{metric}.above_percentile"), *percentile);
            }
            Self::BelowPercentile { percentile } => {
                out.insert(format!("{metric}.below_percentile"), *percentile);
            }
            Self::OutsidePercentileBand { lower, upper } => {
                out.insert(format!("{metric}.lower_percentile"), *lower);
                out.insert(format!("{metric}.upper_percentile"), *upper);
            }
            Self::AboveRatio { threshold } => {
                out.insert(format!("{metric}.above_ratio"), *threshold);
            }
            Self::BelowRatio { threshold } => {
                out.insert(format!("{metric}.below_ratio"), *threshold);
            }
            Self::ZScoreBeyond { threshold } => {
                out.insert(format!("{metric}.zscore_threshold"), *threshold);
            }
        }
    }

    fn percentiles(&self) -> Vec<f64> {
        match self {
            Self::AbovePercentile { percentile } | Self::BelowPercentile { percentile } => {
                vec![*percentile]
            }
            Self::OutsidePercentileBand { lower, upper } => vec![*lower, *upper],
            _ => Vec::new(),
        }
    }
}

/// One sub-condition of a boolean signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub predicate: Predicate,
}

/// "K of N conditions must hold".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub required: usize,
}

impl Quorum {
    pub fn new(required: usize) -> Self {
        Self { required }
    }

    pub fn is_met(self, holding: usize) -> bool {
        holding >= self.required
    }
}

/// How a signal turns metrics into a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRule {
    Boolean {
        conditions: Vec<Condition>,
        quorum: Quorum,
    },
    /// Min-max intensity against the baseline ladder; `invert` flips it so
    /// that low metric values produce high intensity.
    Continuous {
        metric: String,
        #[serde(default)]
        invert: bool,
    },
}

/// Immutable, versioned description of one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub id: String,
    pub version: u32,
    pub category: SignalCategory,
    #[serde(default)]
    pub direction: SignalDirection,
    /// Weight relative to the other signals of the same category.
    pub component_weight: f64,
    pub baseline_lookback_periods: usize,
    pub rule: SignalRule,
}

impl SignalDefinition {
    pub fn value_kind(&self) -> ValueKind {
        match self.rule {
            SignalRule::Boolean { .. } => ValueKind::Boolean,
            SignalRule::Continuous { .. } => ValueKind::Continuous,
        }
    }

    /// Metrics this signal reads, deduplicated and sorted.
    pub fn metrics(&self) -> Vec<String> {
        let set: BTreeSet<String> = match &self.rule {
            SignalRule::Boolean { conditions, .. } => {
                conditions.iter().map(|c| c.metric.clone()).collect()
            }
            SignalRule::Continuous { metric, .. } => std::iter::once(metric.clone()).collect(),
        };
        set.into_iter().collect()
    }

    /// Flattened named threshold parameters, for audit records.
    pub fn threshold_parameters(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        match &self.rule {
            SignalRule::Boolean { conditions, quorum } => {
                for c in conditions {
                    c.predicate.parameters(&c.metric, &mut out);
                }
                out.insert("quorum.required".to_string(), quorum.required as f64);
                out.insert("quorum.of".to_string(), conditions.len() as f64);
            }
            SignalRule::Continuous { metric, invert } => {
                out.insert(format!("{metric}.invert"), if *invert { 1.0 } else { 0.0 });
            }
        }
        out
    }

    /// Structural checks; returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("signal id must not be empty".into());
        }
        if !self.component_weight.is_finite() || self.component_weight < 0.0 {
            return Err(format!("{}: component_weight must be >= 0", self.id));
        }
        if self.baseline_lookback_periods == 0 {
            return Err(format!("{}: baseline_lookback_periods must be > 0", self.id));
        }
        if let SignalRule::Boolean { conditions, quorum } = &self.rule {
            if conditions.is_empty() {
                return Err(format!("{}: boolean signal needs at least one condition", self.id));
            }
            if quorum.required == 0 || quorum.required > conditions.len() {
                return Err(format!(
                    "{}: quorum {} of {} is not satisfiable",
                    self.id,
                    quorum.required,
                    conditions.len()
                ));
            }
            for c in conditions {
                for p in c.predicate.percentiles() {
                    if !(0.0..=100.0).contains(&p) {
                        return Err(format!("{}: percentile {p} outside [0, 100]", self.id));
                    }
                }
                if let Predicate::OutsidePercentileBand { lower, upper } = c.predicate {
                    if lower >= upper {
                        return Err(format!("{}: band lower {lower} >= upper {upper}", self.id));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn growth() -> SignalDefinition {
        SignalDefinition {
            id: "network_growth_signal".into(),
            version: 1,
            category: SignalCategory::NetworkHealth,
            direction: SignalDirection::Accumulation,
            component_weight: 0.6,
            baseline_lookback_periods: 90,
            rule: SignalRule::Boolean {
                conditions: vec![
                    Condition {
                        metric: "tx_count".into(),
                        predicate: Predicate::AbovePercentile { percentile: 75.0 },
                    },
                    Condition {
                        metric: "active_addresses".into(),
                        predicate: Predicate::AbovePercentile { percentile: 75.0 },
                    },
                ],
                quorum: Quorum::new(2),
            },
        }
    }

    #[test]
    fn metrics_are_sorted_and_unique() {
        assert_eq!(growth().metrics(), vec!["active_addresses", "tx_count"]);
    }

    #[test]
    fn threshold_parameters_include_quorum() {
        let params = growth().threshold_parameters();
        assert_eq!(params["tx_count.above_percentile"], 75.0);
        assert_eq!(params["quorum.required"], 2.0);
        assert_eq!(params["quorum.of"], 2.0);
    }

    #[test]
    fn unsatisfiable_quorum_is_rejected() {
        let mut def = growth();
        if let SignalRule::Boolean { quorum, .. } = &mut def.rule {
            *quorum = Quorum::new(3);
        }
        assert!(def.validate().is_err());
    }

    #[test]
    fn rule_serialises_with_tags() {
        let json = serde_json::to_value(&growth().rule).unwrap();
        assert_eq!(json["type"], "boolean");
        assert_eq!(json["conditions"][0]["predicate"]["kind"], "above_percentile");
    }
}
