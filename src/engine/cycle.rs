// =============================================================================
// Cycle Runner — one (asset, timeframe, timestamp) evaluation
// =============================================================================
//
// Per cycle:
//   1. take the stream lock (at most one in-flight cycle per stream)
//   2. older than the last processed timestamp: hand back the stored
//      artifact for that key, or reject without touching the stream
//   3. fetch inputs, resolve baselines, evaluate, score (bounded by timeout)
//   4. recompute from the same inputs and compare hashes
//   5. gate, record anomalies, append evaluations, upsert the artifact
//
// A cycle never returns an error: any failure yields the neutral BLOCKED
// fallback artifact, recorded as a failed cycle. Stale inputs, failed
// upstream checks and determinism mismatches are kept as anomalies.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audit::hashing::canonical_hash;
use crate::audit::{AnomalyKind, AuditLedger, AuditRecord};
use crate::baseline::BaselineCache;
use crate::decision_envelope::{DecisionEnvelope, ScoreResult};
use crate::engine::source::{CycleInputs, MetricSource};
use crate::errors::EngineError;
use crate::kill_switch::{failed_cycle_decision, DecisionGate, GateSignals};
use crate::runtime_config::EngineConfig;
use crate::scoring::{compute_score, BiasHistory, ScoringContext};
use crate::signals::{EvaluationBatch, SignalEvaluation, SignalEvaluator};
use crate::types::{ScoreKey, StreamKey, Timeframe};

/// Hash of an evaluation set, ignoring wall-clock fields.
fn evaluation_set_hash(evaluations: &[SignalEvaluation]) -> String {
    #[derive(Serialize)]
    struct Row<'a> {
        signal_id: &'a str,
        signal_version: u32,
        value: crate::signals::SignalValue,
        confidence: f64,
        input_data_hash: &'a str,
    }
    let rows: Vec<Row<'_>> = evaluations
        .iter()
        .map(|e| Row {
            signal_id: &e.signal_id,
            signal_version: e.signal_version,
            value: e.value,
            confidence: e.confidence,
            input_data_hash: &e.input_data_hash,
        })
        .collect();
    canonical_hash(&rows)
}

fn omitted_ids(batch: &EvaluationBatch) -> Vec<String> {
    batch
        .omitted
        .iter()
        .filter_map(|e| match e {
            EngineError::MissingMetricInput { signal_id, .. } => Some(signal_id.clone()),
            _ => None,
        })
        .collect()
}

/// Output of the bounded part of a cycle.
struct Computed {
    inputs: CycleInputs,
    evaluations: Vec<SignalEvaluation>,
    result: ScoreResult,
    determinism: Result<(), EngineError>,
    quality_issues: Vec<EngineError>,
}

pub struct CycleRunner {
    source: Arc<dyn MetricSource>,
    baselines: Arc<BaselineCache>,
    ledger: Arc<AuditLedger>,
    gate: Arc<DecisionGate>,
    stream_locks: parking_lot::Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CycleRunner {
    pub fn new(
        source: Arc<dyn MetricSource>,
        baselines: Arc<BaselineCache>,
        ledger: Arc<AuditLedger>,
        gate: Arc<DecisionGate>,
    ) -> Self {
        Self {
            source,
            baselines,
            ledger,
            gate,
            stream_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn gate(&self) -> &Arc<DecisionGate> {
        &self.gate
    }

    fn stream_lock(&self, stream: &StreamKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.stream_locks.lock().entry(stream.clone()).or_default())
    }

    // -------------------------------------------------------------------------
    // Baselines
    // -------------------------------------------------------------------------

    /// Recompute every baseline for (asset, timeframe) as of `as_of` from
    /// source history, then bust the cache for that stream.
    pub async fn recalculate_baselines(
        &self,
        config: &EngineConfig,
        asset: &str,
        timeframe: Timeframe,
        as_of: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let mut lookback: BTreeMap<String, usize> = BTreeMap::new();
        for def in &config.signals {
            for metric in def.metrics() {
                let entry = lookback.entry(metric).or_insert(0);
                *entry = (*entry).max(def.baseline_lookback_periods);
            }
        }

        let mut histories = BTreeMap::new();
        for (metric, periods) in lookback {
            let values = self
                .source
                .fetch_history(asset, timeframe, &metric, as_of, periods)
                .await?;
            histories.insert(metric, values);
        }

        let written = self.baselines.store().recalculate(
            asset,
            timeframe,
            as_of,
            &config.signals,
            &histories,
            &config.baseline,
        );
        self.baselines.bust(asset, timeframe);
        Ok(written)
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run one cycle under the config snapshot `config`.
    pub async fn run_cycle(&self, config: Arc<EngineConfig>, key: ScoreKey) -> DecisionEnvelope {
        let stream = key.stream();
        let lock = self.stream_lock(&stream);
        let _guard = lock.lock().await;

        if let Some(last) = self.ledger.last_timestamp(&stream) {
            if key.timestamp < last {
                if let Some(stored) = self.ledger.audit(&key) {
                    debug!(key = %key, last = %last, "older key already stored");
                    return stored.envelope;
                }
                let err = EngineError::OutOfOrderCycle {
                    key: key.clone(),
                    last: last.to_rfc3339(),
                };
                return self.reject(&config, &key, err);
            }
        }

        let timeout_ms = config.cycle_timeout_ms;
        let computed =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.compute(&config, &key)).await;

        match computed {
            Ok(Ok(computed)) => self.publish(&config, &key, computed),
            Ok(Err(e)) => self.fail(&config, &key, e),
            Err(_) => {
                warn!(key = %key, timeout_ms, "cycle abandoned after timeout");
                self.fail(&config, &key, EngineError::CycleTimeout { key: key.clone(), timeout_ms })
            }
        }
    }

    async fn compute(&self, config: &EngineConfig, key: &ScoreKey) -> Result<Computed, EngineError> {
        let inputs = self.source.fetch_cycle(key).await?;
        let baselines = self.baselines.get(&key.asset, key.timeframe, key.timestamp);

        let evaluator = SignalEvaluator::new(config.evaluator.clone());
        let input_data_hash = canonical_hash(&(key, &inputs, baselines.as_ref()));
        let config_hash = config.config_hash();
        let history_biases =
            self.ledger
                .prior_biases(&key.stream(), key.timestamp, config.historical_window);
        let mut history = BiasHistory::new(config.historical_window);
        for b in history_biases {
            history.push(b);
        }

        let run = || {
            let batch = evaluator.evaluate_all(&config.signals, key, &inputs.metrics, &baselines);
            let omitted = omitted_ids(&batch);
            let ctx = ScoringContext {
                key,
                data_completeness: inputs.data_completeness,
                input_data_hash: &input_data_hash,
                config_hash: &config_hash,
                omitted_signals: &omitted,
            };
            let result = compute_score(config, &ctx, &batch.evaluations, &history);
            (batch, result)
        };

        let (batch, result) = run();
        let (recheck_batch, recheck) = run();

        let determinism = if evaluation_set_hash(&batch.evaluations)
            != evaluation_set_hash(&recheck_batch.evaluations)
            || result.calculation_hash != recheck.calculation_hash
        {
            Err(EngineError::DeterminismViolation {
                key: key.clone(),
                first: result.calculation_hash.clone(),
                second: recheck.calculation_hash.clone(),
            })
        } else {
            Ok(())
        };

        let quality_issues = batch.data_quality_issues(config.baseline.min_sample_size);

        Ok(Computed {
            inputs,
            evaluations: batch.evaluations,
            result,
            determinism,
            quality_issues,
        })
    }

    fn publish(&self, config: &EngineConfig, key: &ScoreKey, computed: Computed) -> DecisionEnvelope {
        let Computed {
            inputs,
            evaluations,
            result,
            determinism,
            quality_issues,
        } = computed;

        if let Some(previous) = self.ledger.previous_confidence(&key.stream(), key.timestamp) {
            let drop = previous - result.confidence;
            if drop > config.confidence_drop_threshold {
                self.ledger.record_anomaly(
                    AnomalyKind::ConfidenceDrop,
                    key,
                    format!("confidence fell {previous:.4} -> {:.4}", result.confidence),
                );
            }
        }

        let regime: Vec<&str> = evaluations
            .iter()
            .filter(|e| e.regime_change_detected)
            .map(|e| e.signal_id.as_str())
            .collect();
        if !regime.is_empty() {
            self.ledger.record_anomaly(
                AnomalyKind::RegimeChange,
                key,
                format!("regime change on {}", regime.join(", ")),
            );
        }

        let signals = GateSignals {
            invariant_failures: inputs.invariant_failures,
            data_lag_secs: inputs.data_age_secs,
            determinism_ok: determinism.is_ok(),
        };

        let mut issues = quality_issues;
        if let Err(e) = determinism {
            issues.push(e);
        }
        if signals.data_lag_secs > config.gate.max_data_age_secs {
            issues.push(EngineError::StaleDataError {
                lag_secs: signals.data_lag_secs,
                max_secs: config.gate.max_data_age_secs,
            });
        }
        if !signals.invariant_failures.is_empty() {
            issues.push(EngineError::InvariantCheckFailed(signals.invariant_failures.join(", ")));
        }
        for issue in &issues {
            self.record_issue(key, issue);
        }

        let decision = self.gate.evaluate(&config.gate, &result, &signals);

        self.ledger.append_evaluations(&evaluations);
        let envelope = DecisionEnvelope::new(result, decision);
        let outcome = self.ledger.upsert(AuditRecord::new(
            envelope.clone(),
            evaluations,
            config.config_version,
        ));

        info!(
            key = %key,
            score = envelope.onchain_score(),
            confidence = envelope.result.confidence,
            bias = %envelope.result.bias,
            state = %envelope.state(),
            active = envelope.result.active_signal_count,
            conflicts = envelope.result.conflicting_signal_count,
            stored = ?outcome,
            "cycle complete"
        );
        envelope
    }

    /// Anomaly record for a cycle-level issue. Omitted signals are only
    /// logged; the result already lists them.
    fn record_issue(&self, key: &ScoreKey, issue: &EngineError) {
        let kind = match issue {
            EngineError::DeterminismViolation { .. } => AnomalyKind::DeterminismViolation,
            EngineError::StaleDataError { .. } => AnomalyKind::StaleData,
            EngineError::InvariantCheckFailed(_) => AnomalyKind::InvariantViolation,
            EngineError::InsufficientBaselineData { .. } => AnomalyKind::InsufficientBaseline,
            _ => {
                debug!(key = %key, issue = %issue, "data quality");
                return;
            }
        };
        self.ledger.record_anomaly(kind, key, issue.to_string());
    }

    /// Neutral BLOCKED fallback for a cycle that never ran. Recorded as a
    /// failure but neither stored nor fed to the gate, so the stream keeps
    /// its state.
    fn reject(&self, config: &EngineConfig, key: &ScoreKey, err: EngineError) -> DecisionEnvelope {
        let cause = err.to_string();
        self.ledger.record_failure(key, cause.clone());
        self.ledger.record_anomaly(AnomalyKind::CycleFailure, key, cause.clone());

        let result = ScoreResult::neutral(key, canonical_hash(key), config.config_hash());
        DecisionEnvelope::failed(result, failed_cycle_decision(&cause))
    }

    /// Neutral BLOCKED fallback for a cycle that started and failed; stored
    /// under its key and reported to the gate.
    fn fail(&self, config: &EngineConfig, key: &ScoreKey, err: EngineError) -> DecisionEnvelope {
        let cause = err.to_string();
        let envelope = self.reject(config, key, err);
        self.gate.record_failure(&key.stream(), &cause);
        self.ledger.upsert(AuditRecord::new(
            envelope.clone(),
            Vec::new(),
            config.config_version,
        ));
        envelope
    }
}

impl std::fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleRunner")
            .field("streams", &self.stream_locks.lock().len())
            .field("stored_results", &self.ledger.stored_results())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
