// =============================================================================
// Audit Ledger — evaluation log, score/decision log, anomalies
// =============================================================================
//
//   evaluation log : append-only; an exact duplicate row is ignored
//   score log      : latest record per (asset, timeframe, timestamp), upsert
//                    is a no-op when the calculation hash is unchanged;
//                    every accepted write is also appended to history
//   failed cycles  : append-only
//   anomalies      : append-only, uuid ids
//
// Logs are bounded; the oldest rows fall off once a log is full. The score
// log evicts its oldest keys but keeps `min_per_stream` records per stream.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decision_envelope::DecisionEnvelope;
use crate::signals::SignalEvaluation;
use crate::types::{Bias, ScoreKey, StreamKey, Timeframe};

const DEFAULT_CAPACITY: usize = 50_000;
const DEFAULT_MIN_PER_STREAM: usize = 10;

/// Everything needed to re-verify one stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub key: ScoreKey,
    pub input_data_hash: String,
    pub config_hash: String,
    pub config_version: u32,
    pub calculation_hash: String,
    /// The raw evaluation set the score was computed from.
    pub evaluations: Vec<SignalEvaluation>,
    pub envelope: DecisionEnvelope,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(envelope: DecisionEnvelope, evaluations: Vec<SignalEvaluation>, config_version: u32) -> Self {
        Self {
            key: envelope.key(),
            input_data_hash: envelope.result.input_data_hash.clone(),
            config_hash: envelope.result.config_hash.clone(),
            config_version,
            calculation_hash: envelope.result.calculation_hash.clone(),
            evaluations,
            envelope,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same calculation hash already stored; nothing written.
    Unchanged,
    Replaced { previous_hash: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCycle {
    pub key: ScoreKey,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    DeterminismViolation,
    ConfidenceDrop,
    RegimeChange,
    InsufficientBaseline,
    StaleData,
    InvariantViolation,
    CycleFailure,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DeterminismViolation => "determinism_violation",
            Self::ConfidenceDrop => "confidence_drop",
            Self::RegimeChange => "regime_change",
            Self::InsufficientBaseline => "insufficient_baseline",
            Self::StaleData => "stale_data",
            Self::InvariantViolation => "invariant_violation",
            Self::CycleFailure => "cycle_failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub key: ScoreKey,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EvaluationRowKey {
    signal_id: String,
    signal_version: u32,
    key: ScoreKey,
    input_data_hash: String,
}

impl EvaluationRowKey {
    fn of(e: &SignalEvaluation) -> Self {
        Self {
            signal_id: e.signal_id.clone(),
            signal_version: e.signal_version,
            key: ScoreKey::new(e.asset.clone(), e.timeframe, e.timestamp),
            input_data_hash: e.input_data_hash.clone(),
        }
    }
}

#[derive(Default)]
struct EvaluationLog {
    rows: VecDeque<SignalEvaluation>,
    seen: HashSet<EvaluationRowKey>,
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) -> Option<T> {
    log.push_back(item);
    if log.len() > capacity {
        log.pop_front()
    } else {
        None
    }
}

/// Thread-safe audit store shared by every cycle.
pub struct AuditLedger {
    capacity: usize,
    min_per_stream: AtomicUsize,
    evaluations: RwLock<EvaluationLog>,
    latest: RwLock<BTreeMap<ScoreKey, AuditRecord>>,
    history: RwLock<VecDeque<AuditRecord>>,
    failed: RwLock<VecDeque<FailedCycle>>,
    anomalies: RwLock<VecDeque<Anomaly>>,
}

impl AuditLedger {
    pub fn new(capacity: usize) -> Self {
        Self::with_retention(capacity, DEFAULT_MIN_PER_STREAM)
    }

    /// `min_per_stream` stored results survive score-log eviction for every
    /// stream; set it to the bias history window.
    pub fn with_retention(capacity: usize, min_per_stream: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            min_per_stream: AtomicUsize::new(min_per_stream),
            evaluations: RwLock::new(EvaluationLog::default()),
            latest: RwLock::new(BTreeMap::new()),
            history: RwLock::new(VecDeque::new()),
            failed: RwLock::new(VecDeque::new()),
            anomalies: RwLock::new(VecDeque::new()),
        }
    }

    pub fn set_min_per_stream(&self, n: usize) {
        self.min_per_stream.store(n, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Evaluation log
    // -------------------------------------------------------------------------

    /// Append evaluations, skipping exact duplicates. Returns rows written.
    pub fn append_evaluations(&self, evaluations: &[SignalEvaluation]) -> usize {
        let mut log = self.evaluations.write();
        let mut written = 0;
        for e in evaluations {
            let row_key = EvaluationRowKey::of(e);
            if !log.seen.insert(row_key) {
                continue;
            }
            if let Some(evicted) = push_bounded(&mut log.rows, e.clone(), self.capacity) {
                log.seen.remove(&EvaluationRowKey::of(&evicted));
            }
            written += 1;
        }
        written
    }

    pub fn evaluations_for(&self, key: &ScoreKey) -> Vec<SignalEvaluation> {
        self.evaluations
            .read()
            .rows
            .iter()
            .filter(|e| e.asset == key.asset && e.timeframe == key.timeframe && e.timestamp == key.timestamp)
            .cloned()
            .collect()
    }

    pub fn evaluation_count(&self) -> usize {
        self.evaluations.read().rows.len()
    }

    // -------------------------------------------------------------------------
    // Score / decision log
    // -------------------------------------------------------------------------

    /// Idempotent upsert keyed by (asset, timeframe, timestamp).
    pub fn upsert(&self, record: AuditRecord) -> UpsertOutcome {
        let mut latest = self.latest.write();
        let outcome = match latest.get(&record.key) {
            Some(existing) if existing.calculation_hash == record.calculation_hash => {
                debug!(key = %record.key, "identical result already stored");
                return UpsertOutcome::Unchanged;
            }
            Some(existing) => UpsertOutcome::Replaced {
                previous_hash: existing.calculation_hash.clone(),
            },
            None => UpsertOutcome::Inserted,
        };
        if let UpsertOutcome::Replaced { previous_hash } = &outcome {
            info!(
                key = %record.key,
                previous = %previous_hash,
                current = %record.calculation_hash,
                "stored result replaced"
            );
        }
        latest.insert(record.key.clone(), record.clone());
        self.evict_overflow(&mut latest, &record.key);
        drop(latest);
        push_bounded(&mut self.history.write(), record, self.capacity);
        outcome
    }

    /// Drop the oldest keys while over capacity, skipping streams already at
    /// their retention floor. `keep` is never evicted.
    fn evict_overflow(&self, latest: &mut BTreeMap<ScoreKey, AuditRecord>, keep: &ScoreKey) {
        let floor = self.min_per_stream.load(Ordering::Relaxed);
        while latest.len() > self.capacity {
            let mut per_stream: HashMap<StreamKey, usize> = HashMap::new();
            for k in latest.keys() {
                *per_stream.entry(k.stream()).or_default() += 1;
            }
            let victim = latest
                .keys()
                .filter(|k| *k != keep)
                .filter(|k| per_stream.get(&k.stream()).copied().unwrap_or(0) > floor)
                .min_by_key(|k| k.timestamp)
                .cloned();
            let Some(victim) = victim else {
                debug!(stored = latest.len(), capacity = self.capacity, "score log at retention floor");
                break;
            };
            latest.remove(&victim);
            debug!(key = %victim, "stored result evicted");
        }
    }

    /// Audit lookup by exact key.
    pub fn audit(&self, key: &ScoreKey) -> Option<AuditRecord> {
        self.latest.read().get(key).cloned()
    }

    /// Recompute the calculation hash of a stored record and compare it with
    /// the recorded one. `None` when nothing is stored for `key`.
    pub fn verify_integrity(&self, key: &ScoreKey) -> Option<bool> {
        let latest = self.latest.read();
        let record = latest.get(key)?;
        let result = &record.envelope.result;
        Some(result.verify() && record.calculation_hash == result.calculation_hash)
    }

    /// Every accepted write for `key`, oldest first.
    pub fn history_for(&self, key: &ScoreKey) -> Vec<AuditRecord> {
        self.history
            .read()
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }

    fn stream_range<'a>(
        latest: &'a BTreeMap<ScoreKey, AuditRecord>,
        asset: &str,
        timeframe: Timeframe,
        before: Option<DateTime<Utc>>,
    ) -> impl DoubleEndedIterator<Item = &'a AuditRecord> {
        let lo = ScoreKey::new(asset, timeframe, DateTime::<Utc>::MIN_UTC);
        let hi = ScoreKey::new(asset, timeframe, before.unwrap_or(DateTime::<Utc>::MAX_UTC));
        let range = if before.is_some() {
            latest.range(lo..hi)
        } else {
            latest.range(lo..=hi)
        };
        range.map(|(_, r)| r)
    }

    /// Newest stored artifact for (asset, timeframe).
    pub fn latest_for_stream(&self, asset: &str, timeframe: Timeframe) -> Option<DecisionEnvelope> {
        let latest = self.latest.read();
        let out = Self::stream_range(&latest, asset, timeframe, None)
            .next_back()
            .map(|r| r.envelope.clone());
        out
    }

    /// Newest timestamp stored for a stream, failed or not.
    pub fn last_timestamp(&self, stream: &StreamKey) -> Option<DateTime<Utc>> {
        let latest = self.latest.read();
        let out = Self::stream_range(&latest, &stream.asset, stream.timeframe, None)
            .next_back()
            .map(|r| r.key.timestamp);
        out
    }

    /// Biases of the last `n` successful results strictly before `before`,
    /// oldest first.
    pub fn prior_biases(&self, stream: &StreamKey, before: DateTime<Utc>, n: usize) -> Vec<Bias> {
        let latest = self.latest.read();
        let mut out: Vec<Bias> = Self::stream_range(&latest, &stream.asset, stream.timeframe, Some(before))
            .rev()
            .filter(|r| !r.envelope.cycle_failed)
            .take(n)
            .map(|r| r.envelope.result.bias)
            .collect();
        out.reverse();
        out
    }

    /// Confidence of the newest successful result strictly before `before`.
    pub fn previous_confidence(&self, stream: &StreamKey, before: DateTime<Utc>) -> Option<f64> {
        let latest = self.latest.read();
        let out = Self::stream_range(&latest, &stream.asset, stream.timeframe, Some(before))
            .rev()
            .find(|r| !r.envelope.cycle_failed)
            .map(|r| r.envelope.result.confidence);
        out
    }

    /// Newest artifacts across all streams, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DecisionEnvelope> {
        let mut all: Vec<DecisionEnvelope> = self
            .latest
            .read()
            .values()
            .map(|r| r.envelope.clone())
            .collect();
        all.sort_by(|a, b| b.result.timestamp.cmp(&a.result.timestamp).then(b.created_at.cmp(&a.created_at)));
        all.truncate(limit);
        all
    }

    pub fn stored_results(&self) -> usize {
        self.latest.read().len()
    }

    // -------------------------------------------------------------------------
    // Failures and anomalies
    // -------------------------------------------------------------------------

    pub fn record_failure(&self, key: &ScoreKey, error: impl Into<String>) {
        let error = error.into();
        warn!(key = %key, error = %error, "cycle failed");
        push_bounded(
            &mut self.failed.write(),
            FailedCycle {
                key: key.clone(),
                error,
                failed_at: Utc::now(),
            },
            self.capacity,
        );
    }

    pub fn failures(&self, limit: usize) -> Vec<FailedCycle> {
        self.failed.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn record_anomaly(&self, kind: AnomalyKind, key: &ScoreKey, detail: impl Into<String>) -> Anomaly {
        let anomaly = Anomaly {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            key: key.clone(),
            detail: detail.into(),
            detected_at: Utc::now(),
        };
        warn!(
            id = %anomaly.id,
            kind = %kind,
            key = %key,
            detail = %anomaly.detail,
            "anomaly recorded"
        );
        push_bounded(&mut self.anomalies.write(), anomaly.clone(), self.capacity);
        anomaly
    }

    /// Newest first.
    pub fn anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.anomalies.read().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger")
            .field("evaluations", &self.evaluation_count())
            .field("results", &self.stored_results())
            .field("min_per_stream", &self.min_per_stream.load(Ordering::Relaxed))
            .field("anomalies", &self.anomalies.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
