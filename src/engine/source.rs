// =============================================================================
// Metric Source — the upstream collaborator seam
// =============================================================================
//
// Normalisation, whale detection and wallet classification live outside this
// engine. They hand it, per cycle, a bundle of named metric values plus
// data completeness, data lag and the outcome of their own verification
// checks. Baseline recalculation additionally reads metric history.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::{ScoreKey, Timeframe};

/// Fixed-shape upstream bundle for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleInputs {
    pub metrics: BTreeMap<String, f64>,
    pub data_completeness: f64,
    /// Upstream lag behind the cycle timestamp.
    #[serde(default)]
    pub data_age_secs: u64,
    /// Names of upstream verification checks that failed.
    #[serde(default)]
    pub invariant_failures: Vec<String>,
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// The bundle for one (asset, timeframe, timestamp).
    async fn fetch_cycle(&self, key: &ScoreKey) -> Result<CycleInputs, EngineError>;

    /// Up to `periods` observations of `metric` at or before `until`,
    /// oldest first.
    async fn fetch_history(
        &self,
        asset: &str,
        timeframe: Timeframe,
        metric: &str,
        until: DateTime<Utc>,
        periods: usize,
    ) -> Result<Vec<f64>, EngineError>;
}

type SeriesId = (String, Timeframe, String);

/// Source fed by pushes (the ingest endpoint, tests, backfill).
#[derive(Default)]
pub struct InMemoryMetricSource {
    cycles: RwLock<HashMap<ScoreKey, CycleInputs>>,
    history: RwLock<HashMap<SeriesId, BTreeMap<DateTime<Utc>, f64>>>,
    delay: Option<Duration>,
}

impl InMemoryMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `fetch_cycle` sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Store a cycle bundle and record its metrics as history points.
    pub fn push_cycle(&self, key: ScoreKey, inputs: CycleInputs) {
        {
            let mut history = self.history.write();
            for (metric, value) in &inputs.metrics {
                history
                    .entry((key.asset.clone(), key.timeframe, metric.clone()))
                    .or_default()
                    .insert(key.timestamp, *value);
            }
        }
        self.cycles.write().insert(key, inputs);
    }

    /// Record one historical observation without a cycle bundle.
    pub fn push_observation(
        &self,
        asset: &str,
        timeframe: Timeframe,
        metric: &str,
        at: DateTime<Utc>,
        value: f64,
    ) {
        self.history
            .write()
            .entry((asset.to_string(), timeframe, metric.to_string()))
            .or_default()
            .insert(at, value);
    }

    /// Timestamps with a stored bundle for (asset, timeframe) in
    /// `[from, to]`, ascending.
    pub fn cycle_timestamps(
        &self,
        asset: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut out: Vec<DateTime<Utc>> = self
            .cycles
            .read()
            .keys()
            .filter(|k| k.asset == asset && k.timeframe == timeframe)
            .map(|k| k.timestamp)
            .filter(|ts| *ts >= from && *ts <= to)
            .collect();
        out.sort();
        out
    }

    async fn maybe_delay(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl MetricSource for InMemoryMetricSource {
    async fn fetch_cycle(&self, key: &ScoreKey) -> Result<CycleInputs, EngineError> {
        self.maybe_delay().await;
        self.cycles
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::Source(format!("no inputs for {key}")))
    }

    async fn fetch_history(
        &self,
        asset: &str,
        timeframe: Timeframe,
        metric: &str,
        until: DateTime<Utc>,
        periods: usize,
    ) -> Result<Vec<f64>, EngineError> {
        let history = self.history.read();
        let Some(series) = history.get(&(asset.to_string(), timeframe, metric.to_string())) else {
            return Ok(Vec::new());
        };
        let mut values: Vec<f64> = series
            .range(..=until)
            .rev()
            .take(periods)
            .map(|(_, v)| *v)
            .collect();
        values.reverse();
        Ok(values)
    }
}
