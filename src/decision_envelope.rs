// =============================================================================
// Decision Envelope — the read-only artifact handed to downstream consumers
// =============================================================================
//
// One envelope per (asset, timeframe, timestamp): the `ScoreResult` of the
// cycle flattened together with the `DecisionState` the gate derived from
// it. Consumers must not act on an envelope whose usage policy says
// `allowed = false`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::hashing::canonical_hash;
use crate::scoring::confidence::SubConfidences;
use crate::types::{Bias, GateState, ScoreKey, Timeframe};

/// Neutral score used whenever no trustworthy score exists.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Per-category points; `risk_penalty` is deducted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub network_health: f64,
    pub capital_flow: f64,
    pub smart_money: f64,
    pub risk_penalty: f64,
}

/// Composite score of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub asset: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "onchain_score", alias = "overall_score")]
    pub overall_score: f64,
    pub bias: Bias,
    pub component_scores: ComponentScores,
    pub confidence: f64,
    pub confidence_breakdown: SubConfidences,

    pub active_signal_count: usize,
    pub conflicting_signal_count: usize,
    pub data_completeness: f64,
    /// Mean baseline stability of the active signals.
    pub stability_score: f64,
    /// Signals dropped this cycle for missing inputs.
    #[serde(default)]
    pub omitted_signals: Vec<String>,

    pub input_data_hash: String,
    pub config_hash: String,
    pub calculation_hash: String,
    /// Wall-clock time of the computation; excluded from the hash.
    pub calculation_time: DateTime<Utc>,
}

/// Fields covered by the calculation hash.
#[derive(Serialize)]
struct HashedFields<'a> {
    asset: &'a str,
    timeframe: Timeframe,
    timestamp: DateTime<Utc>,
    overall_score: f64,
    bias: Bias,
    component_scores: &'a ComponentScores,
    confidence: f64,
    confidence_breakdown: &'a SubConfidences,
    active_signal_count: usize,
    conflicting_signal_count: usize,
    data_completeness: f64,
    stability_score: f64,
    omitted_signals: &'a [String],
    input_data_hash: &'a str,
    config_hash: &'a str,
}

impl ScoreResult {
    /// Neutral fallback: score 50, confidence 0, neutral bias.
    pub fn neutral(key: &ScoreKey, input_data_hash: String, config_hash: String) -> Self {
        let mut result = Self {
            asset: key.asset.clone(),
            timeframe: key.timeframe,
            timestamp: key.timestamp,
            overall_score: NEUTRAL_SCORE,
            bias: Bias::Neutral,
            component_scores: ComponentScores::default(),
            confidence: 0.0,
            confidence_breakdown: SubConfidences::default(),
            active_signal_count: 0,
            conflicting_signal_count: 0,
            data_completeness: 0.0,
            stability_score: 0.0,
            omitted_signals: Vec::new(),
            input_data_hash,
            config_hash,
            calculation_hash: String::new(),
            calculation_time: Utc::now(),
        };
        result.seal();
        result
    }

    pub fn key(&self) -> ScoreKey {
        ScoreKey::new(self.asset.clone(), self.timeframe, self.timestamp)
    }

    /// Hash over everything except `calculation_hash` and `calculation_time`.
    pub fn compute_hash(&self) -> String {
        canonical_hash(&HashedFields {
            asset: &self.asset,
            timeframe: self.timeframe,
            timestamp: self.timestamp,
            overall_score: self.overall_score,
            bias: self.bias,
            component_scores: &self.component_scores,
            confidence: self.confidence,
            confidence_breakdown: &self.confidence_breakdown,
            active_signal_count: self.active_signal_count,
            conflicting_signal_count: self.conflicting_signal_count,
            data_completeness: self.data_completeness,
            stability_score: self.stability_score,
            omitted_signals: &self.omitted_signals,
            input_data_hash: &self.input_data_hash,
            config_hash: &self.config_hash,
        })
    }

    /// Fill in `calculation_hash`.
    pub fn seal(&mut self) {
        self.calculation_hash = self.compute_hash();
    }

    /// Whether the stored hash still matches the content.
    pub fn verify(&self) -> bool {
        self.calculation_hash == self.compute_hash()
    }
}

/// Machine-readable instruction to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePolicy {
    pub allowed: bool,
    pub recommended_weight: f64,
    pub notes: String,
}

/// Gate verdict for one ScoreResult. Derived, never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionState {
    pub state: GateState,
    pub usage_policy: UsagePolicy,
    pub block_reason: Option<String>,
    /// Every rule that matched, in evaluation order.
    #[serde(default)]
    pub triggered_rules: Vec<String>,
}

/// The artifact published for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub result: ScoreResult,
    #[serde(flatten)]
    pub decision: DecisionState,
    /// True when the cycle was abandoned and this is the fallback artifact.
    pub cycle_failed: bool,
    pub created_at: DateTime<Utc>,
}

impl DecisionEnvelope {
    pub fn new(result: ScoreResult, decision: DecisionState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            result,
            decision,
            cycle_failed: false,
            created_at: Utc::now(),
        }
    }

    /// Fallback artifact for an abandoned cycle.
    pub fn failed(result: ScoreResult, decision: DecisionState) -> Self {
        Self {
            cycle_failed: true,
            ..Self::new(result, decision)
        }
    }

    pub fn key(&self) -> ScoreKey {
        self.result.key()
    }

    pub fn onchain_score(&self) -> f64 {
        self.result.overall_score
    }

    pub fn state(&self) -> GateState {
        self.decision.state
    }

    pub fn is_usable(&self) -> bool {
        self.decision.usage_policy.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> ScoreKey {
        ScoreKey::new("BTC", Timeframe::H4, Utc.with_ymd_and_hms(2024, 5, 5, 8, 0, 0).unwrap())
    }

    #[test]
    fn neutral_result_is_sealed() {
        let r = ScoreResult::neutral(&key(), "in".into(), "cfg".into());
        assert_eq!(r.overall_score, 50.0);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.bias, Bias::Neutral);
        assert!(r.verify());
    }

    #[test]
    fn hash_ignores_calculation_time_but_not_content() {
        let a = ScoreResult::neutral(&key(), "in".into(), "cfg".into());
        let mut b = a.clone();
        b.calculation_time = b.calculation_time + chrono::Duration::seconds(30);
        assert_eq!(a.compute_hash(), b.compute_hash());

        b.overall_score = 51.0;
        assert!(!b.verify());
    }

    #[test]
    fn envelope_serialises_consumer_fields_flat() {
        let result = ScoreResult::neutral(&key(), "in".into(), "cfg".into());
        let decision = DecisionState {
            state: GateState::Blocked,
            usage_policy: UsagePolicy {
                allowed: false,
                recommended_weight: 0.0,
                notes: "blocked: data_stale".into(),
            },
            block_reason: Some("data_stale".into()),
            triggered_rules: vec!["data_stale".into()],
        };
        let env = DecisionEnvelope::failed(result, decision);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["onchain_score"], 50.0);
        assert_eq!(json["state"], "BLOCKED");
        assert_eq!(json["usage_policy"]["allowed"], false);
        assert_eq!(json["cycle_failed"], true);
        assert!(json["calculation_hash"].as_str().unwrap().len() == 64);

        let back: DecisionEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.result.calculation_hash, env.result.calculation_hash);
    }
}
