// =============================================================================
// Decision Gate — ACTIVE / DEGRADED / BLOCKED kill switch
// =============================================================================
//
// Rules, first match wins:
//   0. operator kill switch engaged        → BLOCKED  manual_override
//   1. confidence < min_confidence          → BLOCKED  confidence_below_minimum
//   2. upstream invariant check failed      → BLOCKED  invariant_violation
//   3. data lag > max_data_age_secs         → BLOCKED  data_stale
//   4. determinism recheck failed           → BLOCKED  nondeterministic_result
//   5. stability < min_stability OR completeness < min_completeness
//      OR conflicts > max_conflicting_signals → DEGRADED
//   6. otherwise                             → ACTIVE
//
// The verdict is recomputed from scratch every cycle. The only memory the
// gate keeps is the last state per stream, used to log transitions, and the
// operator override.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decision_envelope::{DecisionState, ScoreResult, UsagePolicy};
use crate::runtime_config::GateThresholds;
use crate::types::{GateState, StreamKey};

pub const REASON_MANUAL_OVERRIDE: &str = "manual_override";
pub const REASON_LOW_CONFIDENCE: &str = "confidence_below_minimum";
pub const REASON_INVARIANT: &str = "invariant_violation";
pub const REASON_STALE: &str = "data_stale";
pub const REASON_NONDETERMINISTIC: &str = "nondeterministic_result";
pub const REASON_LOW_STABILITY: &str = "stability_below_minimum";
pub const REASON_LOW_COMPLETENESS: &str = "completeness_below_minimum";
pub const REASON_CONFLICTS: &str = "conflicting_signals_exceeded";

/// (allowed, recommended_weight) per state. A fixed table, never computed.
pub const fn usage_policy(state: GateState) -> (bool, f64) {
    match state {
        GateState::Active => (true, 1.0),
        GateState::Degraded => (true, 0.3),
        GateState::Blocked => (false, 0.0),
    }
}

/// Everything besides the ScoreResult that the gate looks at.
#[derive(Debug, Clone, Default)]
pub struct GateSignals {
    /// Names of failed upstream verification checks.
    pub invariant_failures: Vec<String>,
    pub data_lag_secs: u64,
    pub determinism_ok: bool,
}

impl GateSignals {
    pub fn healthy() -> Self {
        Self {
            invariant_failures: Vec::new(),
            data_lag_secs: 0,
            determinism_ok: true,
        }
    }
}

/// Operator kill switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub reason: String,
    pub engaged_at: DateTime<Utc>,
}

fn notes_for(state: GateState, triggered: &[String]) -> String {
    match state {
        GateState::Active => "full weight: all gate checks passed".to_string(),
        GateState::Degraded => format!("reduced weight: {}", triggered.join(", ")),
        GateState::Blocked => {
            let (first, rest) = triggered.split_first().map_or(("unknown", &[][..]), |(f, r)| (f.as_str(), r));
            if rest.is_empty() {
                format!("do not use: {first}")
            } else {
                format!("do not use: {first} (also: {})", rest.join(", "))
            }
        }
    }
}

/// Pure rule evaluation.
pub fn decide(
    thresholds: &GateThresholds,
    result: &ScoreResult,
    signals: &GateSignals,
    manual: Option<&ManualOverride>,
) -> DecisionState {
    let mut blocking: Vec<String> = Vec::new();
    if manual.is_some() {
        blocking.push(REASON_MANUAL_OVERRIDE.into());
    }
    if result.confidence < thresholds.min_confidence {
        blocking.push(REASON_LOW_CONFIDENCE.into());
    }
    if !signals.invariant_failures.is_empty() {
        blocking.push(REASON_INVARIANT.into());
    }
    if signals.data_lag_secs > thresholds.max_data_age_secs {
        blocking.push(REASON_STALE.into());
    }
    if !signals.determinism_ok {
        blocking.push(REASON_NONDETERMINISTIC.into());
    }

    let mut degrading: Vec<String> = Vec::new();
    if result.stability_score < thresholds.min_stability {
        degrading.push(REASON_LOW_STABILITY.into());
    }
    if result.data_completeness < thresholds.min_completeness {
        degrading.push(REASON_LOW_COMPLETENESS.into());
    }
    if result.conflicting_signal_count > thresholds.max_conflicting_signals {
        degrading.push(REASON_CONFLICTS.into());
    }

    let (state, block_reason, triggered) = if let Some(first) = blocking.first().cloned() {
        blocking.extend(degrading);
        (GateState::Blocked, Some(first), blocking)
    } else if !degrading.is_empty() {
        (GateState::Degraded, None, degrading)
    } else {
        (GateState::Active, None, Vec::new())
    };

    let (allowed, recommended_weight) = usage_policy(state);
    DecisionState {
        state,
        usage_policy: UsagePolicy {
            allowed,
            recommended_weight,
            notes: notes_for(state, &triggered),
        },
        block_reason,
        triggered_rules: triggered,
    }
}

/// Verdict for a cycle that never produced a trustworthy result.
pub fn failed_cycle_decision(cause: &str) -> DecisionState {
    let (allowed, recommended_weight) = usage_policy(GateState::Blocked);
    DecisionState {
        state: GateState::Blocked,
        usage_policy: UsagePolicy {
            allowed,
            recommended_weight,
            notes: format!("do not use: {REASON_STALE} ({cause})"),
        },
        block_reason: Some(REASON_STALE.into()),
        triggered_rules: vec![REASON_STALE.into()],
    }
}

// =============================================================================
// DecisionGate
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStatus {
    pub manual_override: Option<ManualOverride>,
    pub streams: Vec<StreamGateState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamGateState {
    pub asset: String,
    pub timeframe: String,
    pub state: GateState,
}

/// Stateful wrapper around [`decide`]: holds the operator override and logs
/// per-stream transitions.
pub struct DecisionGate {
    manual: RwLock<Option<ManualOverride>>,
    last_states: RwLock<HashMap<StreamKey, GateState>>,
}

impl DecisionGate {
    pub fn new() -> Self {
        Self {
            manual: RwLock::new(None),
            last_states: RwLock::new(HashMap::new()),
        }
    }

    pub fn evaluate(
        &self,
        thresholds: &GateThresholds,
        result: &ScoreResult,
        signals: &GateSignals,
    ) -> DecisionState {
        let manual = self.manual.read().clone();
        let decision = decide(thresholds, result, signals, manual.as_ref());
        self.record(&result.key().stream(), &decision);
        decision
    }

    /// Record the verdict of a failed cycle so transitions stay visible.
    pub fn record_failure(&self, stream: &StreamKey, cause: &str) {
        self.record(stream, &failed_cycle_decision(cause));
    }

    fn record(&self, stream: &StreamKey, decision: &DecisionState) {
        let previous = self.last_states.write().insert(stream.clone(), decision.state);
        if previous == Some(decision.state) {
            return;
        }
        let from = previous.map_or_else(|| "NONE".to_string(), |s| s.to_string());
        if decision.state == GateState::Blocked {
            warn!(
                asset = %stream.asset,
                timeframe = %stream.timeframe,
                from = %from,
                to = %decision.state,
                reason = decision.block_reason.as_deref().unwrap_or(""),
                "decision gate BLOCKED"
            );
        } else {
            info!(
                asset = %stream.asset,
                timeframe = %stream.timeframe,
                from = %from,
                to = %decision.state,
                rules = ?decision.triggered_rules,
                "decision gate transition"
            );
        }
    }

    /// Engage the operator kill switch; every artifact is BLOCKED until
    /// [`release`](Self::release).
    pub fn kill(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "kill switch engaged: all artifacts blocked");
        *self.manual.write() = Some(ManualOverride {
            reason,
            engaged_at: Utc::now(),
        });
    }

    /// Returns whether an override was engaged.
    pub fn release(&self) -> bool {
        let released = self.manual.write().take().is_some();
        if released {
            info!("kill switch released");
        }
        released
    }

    pub fn manual_override(&self) -> Option<ManualOverride> {
        self.manual.read().clone()
    }

    pub fn last_state(&self, stream: &StreamKey) -> Option<GateState> {
        self.last_states.read().get(stream).copied()
    }

    pub fn status(&self) -> GateStatus {
        let mut streams: Vec<StreamGateState> = self
            .last_states
            .read()
            .iter()
            .map(|(k, s)| StreamGateState {
                asset: k.asset.clone(),
                timeframe: k.timeframe.to_string(),
                state: *s,
            })
            .collect();
        streams.sort_by(|a, b| (&a.asset, &a.timeframe).cmp(&(&b.asset, &b.timeframe)));
        GateStatus {
            manual_override: self.manual_override(),
            streams,
        }
    }
}

impl Default for DecisionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DecisionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionGate")
            .field("manual_override", &self.manual.read().is_some())
            .field("streams", &self.last_states.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScoreKey, Timeframe};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn result(confidence: f64, completeness: f64, stability: f64, conflicts: usize) -> ScoreResult {
        let key = ScoreKey::new("BTC", Timeframe::H1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let mut r = ScoreResult::neutral(&key, "in".into(), "cfg".into());
        r.confidence = confidence;
        r.data_completeness = completeness;
        r.stability_score = stability;
        r.conflicting_signal_count = conflicts;
        r.active_signal_count = 6;
        r.seal();
        r
    }

    #[test]
    fn low_completeness_degrades() {
        let d = decide(&GateThresholds::default(), &result(0.82, 0.75, 0.9, 0), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Degraded);
        assert_eq!(d.usage_policy.recommended_weight, 0.3);
        assert!(d.usage_policy.allowed);
        assert_eq!(d.block_reason, None);
        assert_eq!(d.triggered_rules, vec![REASON_LOW_COMPLETENESS]);
    }

    #[test]
    fn low_confidence_blocks() {
        let d = decide(&GateThresholds::default(), &result(0.55, 0.95, 0.9, 0), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Blocked);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_LOW_CONFIDENCE));
        assert!(!d.usage_policy.allowed);
        assert_eq!(d.usage_policy.recommended_weight, 0.0);
    }

    #[test]
    fn all_clear_is_active() {
        let d = decide(&GateThresholds::default(), &result(0.9, 0.95, 0.9, 2), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Active);
        assert_eq!(d.usage_policy.recommended_weight, 1.0);
        assert!(d.triggered_rules.is_empty());
    }

    #[test]
    fn rule_order_is_strict() {
        let signals = GateSignals {
            invariant_failures: vec!["range_check".into()],
            data_lag_secs: 99_999,
            determinism_ok: false,
        };
        // confidence wins over everything but the override
        let d = decide(&GateThresholds::default(), &result(0.1, 0.5, 0.1, 9), &signals, None);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_LOW_CONFIDENCE));
        assert_eq!(d.triggered_rules[1], REASON_INVARIANT);

        let d = decide(&GateThresholds::default(), &result(0.9, 0.95, 0.9, 0), &signals, None);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_INVARIANT));

        let signals = GateSignals {
            invariant_failures: vec![],
            data_lag_secs: 99_999,
            determinism_ok: false,
        };
        let d = decide(&GateThresholds::default(), &result(0.9, 0.95, 0.9, 0), &signals, None);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_STALE));

        let signals = GateSignals {
            determinism_ok: false,
            ..GateSignals::healthy()
        };
        let d = decide(&GateThresholds::default(), &result(0.9, 0.95, 0.9, 0), &signals, None);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_NONDETERMINISTIC));
    }

    #[test]
    fn low_stability_degrades() {
        let d = decide(&GateThresholds::default(), &result(0.9, 1.0, 0.5, 0), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Degraded);
        assert_eq!(d.block_reason, None);
        assert_eq!(d.triggered_rules, vec![REASON_LOW_STABILITY]);
        assert_eq!(d.usage_policy.recommended_weight, 0.3);

        // just under the line still degrades, the line itself does not
        let d = decide(&GateThresholds::default(), &result(0.9, 1.0, 0.69, 0), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Degraded);
        let d = decide(&GateThresholds::default(), &result(0.9, 1.0, 0.70, 0), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Active);
    }

    #[test]
    fn conflicts_above_max_degrade() {
        let d = decide(&GateThresholds::default(), &result(0.9, 0.95, 0.9, 3), &GateSignals::healthy(), None);
        assert_eq!(d.state, GateState::Degraded);
        assert_eq!(d.triggered_rules, vec![REASON_CONFLICTS]);
    }

    #[test]
    fn manual_override_blocks_until_released() {
        let gate = DecisionGate::new();
        let r = result(0.9, 0.95, 0.9, 0);
        let t = GateThresholds::default();
        gate.kill("maintenance");
        let d = gate.evaluate(&t, &r, &GateSignals::healthy());
        assert_eq!(d.block_reason.as_deref(), Some(REASON_MANUAL_OVERRIDE));
        assert!(gate.release());
        assert!(!gate.release());
        let d = gate.evaluate(&t, &r, &GateSignals::healthy());
        assert_eq!(d.state, GateState::Active);
        // block reason cleared on leaving BLOCKED
        assert_eq!(d.block_reason, None);
        assert_eq!(gate.last_state(&r.key().stream()), Some(GateState::Active));
    }

    #[test]
    fn failed_cycle_is_blocked_stale() {
        let d = failed_cycle_decision("timeout");
        assert_eq!(d.state, GateState::Blocked);
        assert_eq!(d.block_reason.as_deref(), Some(REASON_STALE));
        assert_eq!(d.usage_policy.recommended_weight, 0.0);
    }

    proptest! {
        #[test]
        fn gating_properties_hold(
            confidence in 0.0f64..=1.0,
            completeness in 0.0f64..=1.0,
            stability in 0.0f64..=1.0,
            conflicts in 0usize..6,
            lag in 0u64..20_000,
            determinism_ok in any::<bool>(),
            invariant_failed in any::<bool>(),
        ) {
            let signals = GateSignals {
                invariant_failures: if invariant_failed { vec!["x".into()] } else { vec![] },
                data_lag_secs: lag,
                determinism_ok,
            };
            let d = decide(&GateThresholds::default(), &result(confidence, completeness, stability, conflicts), &signals, None);
            if confidence < 0.60 {
                prop_assert_eq!(d.state, GateState::Blocked);
            }
            match d.state {
                GateState::Blocked => {
                    prop_assert!(!d.usage_policy.allowed);
                    prop_assert_eq!(d.usage_policy.recommended_weight, 0.0);
                    prop_assert!(d.block_reason.is_some());
                }
                GateState::Active => {
                    prop_assert_eq!(d.usage_policy.recommended_weight, 1.0);
                    prop_assert!(d.block_reason.is_none());
                }
                GateState::Degraded => {
                    prop_assert!(d.usage_policy.allowed);
                    prop_assert!(d.block_reason.is_none());
                }
            }
        }
    }
}
