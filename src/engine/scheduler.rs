// =============================================================================
// Scheduler — periodic cycles, baseline refresh, backfill
// =============================================================================
//
// 1h cycles run every 5 minutes, 4h every 20 minutes, 1d hourly. Each tick
// evaluates the start of the period that contains `now` (still open) for
// every configured asset, so ticks inside one period re-score the same key.
// Baselines refresh on their own slower interval.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::decision_envelope::DecisionEnvelope;
use crate::engine::cycle::CycleRunner;
use crate::runtime_config::EngineConfig;
use crate::types::{ScoreKey, Timeframe};

/// Supplies the config snapshot current at the start of each tick.
pub type ConfigHandle = Arc<dyn Fn() -> Arc<EngineConfig> + Send + Sync>;

pub struct Scheduler {
    runner: Arc<CycleRunner>,
    config: ConfigHandle,
}

impl Scheduler {
    pub fn new(runner: Arc<CycleRunner>, config: ConfigHandle) -> Self {
        Self { runner, config }
    }

    /// Evaluate every configured asset for `timeframe` at the period
    /// boundary containing `now`.
    pub async fn tick(&self, timeframe: Timeframe, now: DateTime<Utc>) -> Vec<DecisionEnvelope> {
        let config = (self.config)();
        let at = timeframe.align(now);
        let mut out = Vec::with_capacity(config.assets.len());
        for asset in &config.assets {
            let key = ScoreKey::new(asset.clone(), timeframe, at);
            out.push(self.runner.run_cycle(config.clone(), key).await);
        }
        out
    }

    /// Refresh baselines for every (asset, timeframe) as of `now`.
    pub async fn refresh_baselines(&self, now: DateTime<Utc>) -> usize {
        let config = (self.config)();
        let mut written = 0;
        for asset in &config.assets {
            for &tf in &config.timeframes {
                match self
                    .runner
                    .recalculate_baselines(&config, asset, tf, tf.align(now))
                    .await
                {
                    Ok(n) => written += n,
                    Err(e) => warn!(asset = %asset, timeframe = %tf, error = %e, "baseline refresh failed"),
                }
            }
        }
        written
    }

    /// Recompute the given historical timestamps in ascending order.
    pub async fn backfill(
        &self,
        asset: &str,
        timeframe: Timeframe,
        mut timestamps: Vec<DateTime<Utc>>,
    ) -> Vec<DecisionEnvelope> {
        let config = (self.config)();
        timestamps.sort();
        timestamps.dedup();
        info!(asset, timeframe = %timeframe, count = timestamps.len(), "backfill starting");

        let mut out = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            let key = ScoreKey::new(asset, timeframe, ts);
            out.push(self.runner.run_cycle(config.clone(), key).await);
        }
        let failed = out.iter().filter(|e| e.cycle_failed).count();
        info!(asset, timeframe = %timeframe, failed, "backfill complete");
        out
    }

    /// Spawn one loop per timeframe plus the baseline refresh loop.
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let config = (self.config)();
        let mut handles = Vec::new();

        let refresh = self.clone();
        let every = Duration::from_secs(config.baseline.recalc_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let written = refresh.refresh_baselines(Utc::now()).await;
                info!(written, "baseline refresh");
            }
        }));

        for &tf in &config.timeframes {
            let me = self.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tf.schedule_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let envelopes = me.tick(tf, Utc::now()).await;
                    let blocked = envelopes.iter().filter(|e| !e.is_usable()).count();
                    if blocked > 0 {
                        error!(timeframe = %tf, blocked, "cycles produced unusable artifacts");
                    }
                }
            }));
        }

        info!(timeframes = config.timeframes.len(), "scheduler loops launched");
        handles
    }
}
