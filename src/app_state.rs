// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the engine's subsystems together for the scheduler and the REST API.
// Each subsystem manages its own interior mutability; AppState only owns the
// config snapshot pointer and a version counter.
//
// Config changes swap the whole `Arc<EngineConfig>`: cycles already running
// keep the snapshot they started with.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::audit::{Anomaly, AuditLedger, FailedCycle};
use crate::baseline::{BaselineCache, BaselineStore};
use crate::decision_envelope::DecisionEnvelope;
use crate::engine::{ConfigHandle, CycleRunner, InMemoryMetricSource, Scheduler};
use crate::errors::EngineError;
use crate::kill_switch::{DecisionGate, GateStatus};
use crate::runtime_config::EngineConfig;

/// Anomalies and failures included in a state snapshot.
const SNAPSHOT_TAIL: usize = 20;

/// Rows kept per audit log.
const LEDGER_CAPACITY: usize = 50_000;

pub struct AppState {
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    config: Arc<RwLock<Arc<EngineConfig>>>,
    pub config_path: String,

    // ── Engine ──────────────────────────────────────────────────────────
    pub source: Arc<InMemoryMetricSource>,
    pub baselines: Arc<BaselineCache>,
    pub ledger: Arc<AuditLedger>,
    pub gate: Arc<DecisionGate>,
    pub runner: Arc<CycleRunner>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: EngineConfig, config_path: impl Into<String>) -> Self {
        let store = Arc::new(BaselineStore::new(config.baseline.retained_snapshots));
        let baselines = Arc::new(BaselineCache::new(
            store,
            Duration::from_secs(config.baseline.cache_ttl_secs),
        ));
        let source = Arc::new(InMemoryMetricSource::new());
        let ledger = Arc::new(AuditLedger::with_retention(
            LEDGER_CAPACITY,
            config.historical_window,
        ));
        let gate = Arc::new(DecisionGate::new());
        let runner = Arc::new(CycleRunner::new(
            source.clone(),
            baselines.clone(),
            ledger.clone(),
            gate.clone(),
        ));

        Self {
            state_version: AtomicU64::new(1),
            config: Arc::new(RwLock::new(Arc::new(config))),
            config_path: config_path.into(),
            source,
            baselines,
            ledger,
            gate,
            runner,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// The config snapshot new cycles start with.
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.read().clone()
    }

    pub fn config_handle(&self) -> ConfigHandle {
        let config = self.config.clone();
        Arc::new(move || config.read().clone())
    }

    /// Validate and install a new configuration. Cached baselines are
    /// dropped since signal definitions may have changed.
    pub fn replace_config(&self, new: EngineConfig) -> Result<Arc<EngineConfig>, EngineError> {
        new.validate()?;
        let new = Arc::new(new);
        let previous = std::mem::replace(&mut *self.config.write(), new.clone());
        self.baselines.clear();
        self.ledger.set_min_per_stream(new.historical_window);
        self.increment_version();
        info!(
            from_version = previous.config_version,
            to_version = new.config_version,
            "engine config replaced"
        );
        new.log_summary("api");
        Ok(new)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(self.runner.clone(), self.config_handle()))
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config();
        let mut streams = Vec::new();
        for asset in &config.assets {
            for &tf in &config.timeframes {
                if let Some(env) = self.ledger.latest_for_stream(asset, tf) {
                    streams.push(env);
                }
            }
        }
        let (cache_hits, cache_misses) = self.baselines.stats();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            config_version: config.config_version,
            config_hash: config.config_hash(),
            streams,
            gate: self.gate.status(),
            stored_results: self.ledger.stored_results(),
            evaluation_rows: self.ledger.evaluation_count(),
            baseline_snapshots: self.baselines.store().snapshot_count(),
            cached_baselines: self.baselines.len(),
            cache_hits,
            cache_misses,
            recent_anomalies: self.ledger.anomalies(SNAPSHOT_TAIL),
            recent_failures: self.ledger.failures(SNAPSHOT_TAIL),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub config_version: u32,
    pub config_hash: String,
    /// Latest artifact per configured (asset, timeframe).
    pub streams: Vec<DecisionEnvelope>,
    pub gate: GateStatus,
    pub stored_results: usize,
    pub evaluation_rows: usize,
    pub baseline_snapshots: usize,
    pub cached_baselines: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub recent_anomalies: Vec<Anomaly>,
    pub recent_failures: Vec<FailedCycle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScoreKey, Timeframe};
    use chrono::TimeZone;

    #[test]
    fn invalid_config_is_rejected_and_previous_kept() {
        let state = AppState::new(EngineConfig::default(), "unused.json");
        let mut bad = EngineConfig::default();
        bad.assets.clear();
        assert!(state.replace_config(bad).is_err());
        assert_eq!(state.config().assets, vec!["BTC".to_string()]);
    }

    #[test]
    fn replacing_config_is_seen_by_handles() {
        let state = AppState::new(EngineConfig::default(), "unused.json");
        let handle = state.config_handle();
        let next = EngineConfig {
            config_version: 2,
            ..EngineConfig::default()
        };
        state.replace_config(next).unwrap();
        assert_eq!(handle().config_version, 2);
    }

    #[tokio::test]
    async fn snapshot_lists_latest_per_stream() {
        let state = AppState::new(EngineConfig::default(), "unused.json");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap();
        let env = state
            .runner
            .run_cycle(state.config(), ScoreKey::new("BTC", Timeframe::H4, at))
            .await;
        assert!(env.cycle_failed);

        let snap = state.build_snapshot();
        assert_eq!(snap.streams.len(), 1);
        assert_eq!(snap.streams[0].result.timeframe, Timeframe::H4);
        assert_eq!(snap.recent_failures.len(), 1);
        assert_eq!(snap.stored_results, 1);
    }
}
