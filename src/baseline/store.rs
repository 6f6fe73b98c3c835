// =============================================================================
// Baseline Store — rolling statistical reference per signal metric
// =============================================================================
//
// Each baseline snapshot is keyed by (signal, metric, asset, timeframe,
// as-of). Snapshots are recomputed on their own schedule and handed to
// evaluation cycles as an immutable `BaselineSet`; a cycle never mutates the
// store.
//
//   stability_score        = 1 - CV of the rolling short-window percentile
//   regime_change_detected = |P_short - P_long| > multiple * std_long
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::baseline::stats::{
    coefficient_of_variation, mean, percentile_sorted, sorted_finite, std_dev,
};
use crate::runtime_config::BaselineSettings;
use crate::signals::SignalDefinition;
use crate::types::Timeframe;

// =============================================================================
// Types
// =============================================================================

/// One point of the percentile ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderPoint {
    pub percentile: f64,
    pub value: f64,
}

/// Rolling statistics for one metric of one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub signal_id: String,
    pub metric: String,
    pub asset: String,
    pub timeframe: Timeframe,
    pub as_of: DateTime<Utc>,

    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Ascending by percentile.
    pub ladder: Vec<LadderPoint>,

    pub sample_size: usize,
    /// 1 - coefficient of variation, clamped to [0, 1].
    pub stability_score: f64,
    pub regime_change_detected: bool,
    /// Sample below the configured minimum; evaluations against this
    /// baseline carry zero confidence.
    pub insufficient: bool,
}

impl Baseline {
    /// Compute a baseline from chronologically ordered observations. Only the
    /// last `lookback` finite observations are used.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        signal_id: &str,
        metric: &str,
        asset: &str,
        timeframe: Timeframe,
        as_of: DateTime<Utc>,
        observations: &[f64],
        lookback: usize,
        settings: &BaselineSettings,
    ) -> Self {
        let finite: Vec<f64> = observations.iter().copied().filter(|x| x.is_finite()).collect();
        let start = finite.len().saturating_sub(lookback);
        let window = &finite[start..];
        let sorted = sorted_finite(window);
        let sample_size = sorted.len();

        let ladder: Vec<LadderPoint> = settings
            .percentile_ladder
            .iter()
            .filter_map(|&p| {
                percentile_sorted(&sorted, p).map(|value| LadderPoint { percentile: p, value })
            })
            .collect();

        let stability_score = stability_score(window, settings);
        let regime_change_detected = regime_change(window, &sorted, settings);

        Self {
            signal_id: signal_id.to_string(),
            metric: metric.to_string(),
            asset: asset.to_string(),
            timeframe,
            as_of,
            mean: mean(window).unwrap_or(0.0),
            median: percentile_sorted(&sorted, 50.0).unwrap_or(0.0),
            std_dev: std_dev(window).unwrap_or(0.0),
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            ladder,
            sample_size,
            stability_score,
            regime_change_detected,
            insufficient: sample_size < settings.min_sample_size,
        }
    }

    /// Threshold value at percentile `p`, interpolated between ladder points
    /// and clamped at the ladder extremes.
    pub fn threshold_at(&self, p: f64) -> Option<f64> {
        let first = self.ladder.first()?;
        let last = self.ladder.last()?;
        if p <= first.percentile {
            return Some(first.value);
        }
        if p >= last.percentile {
            return Some(last.value);
        }
        self.ladder.windows(2).find_map(|w| {
            let (a, b) = (w[0], w[1]);
            if p >= a.percentile && p <= b.percentile {
                let span = b.percentile - a.percentile;
                if span <= f64::EPSILON {
                    return Some(a.value);
                }
                Some(a.value + (b.value - a.value) * (p - a.percentile) / span)
            } else {
                None
            }
        })
    }

    /// Lowest and highest ladder values.
    pub fn ladder_bounds(&self) -> Option<(f64, f64)> {
        Some((self.ladder.first()?.value, self.ladder.last()?.value))
    }

    /// Standard score of `x`; `None` when the baseline has no dispersion.
    pub fn z_score(&self, x: f64) -> Option<f64> {
        if self.std_dev <= f64::EPSILON {
            return None;
        }
        Some((x - self.mean) / self.std_dev)
    }
}

fn rolling_percentiles(window: &[f64], settings: &BaselineSettings) -> Vec<f64> {
    let w = settings.short_window;
    if w == 0 || window.len() < w {
        return Vec::new();
    }
    (w..=window.len())
        .filter_map(|end| {
            let sub = sorted_finite(&window[end - w..end]);
            percentile_sorted(&sub, settings.stability_percentile)
        })
        .collect()
}

fn stability_score(window: &[f64], settings: &BaselineSettings) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let rolling = rolling_percentiles(window, settings);
    let start = rolling.len().saturating_sub(settings.stability_points);
    let recent = &rolling[start..];
    if recent.len() < 2 {
        return 1.0;
    }
    match coefficient_of_variation(recent) {
        Some(cv) if cv.is_finite() => (1.0 - cv).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn regime_change(window: &[f64], sorted: &[f64], settings: &BaselineSettings) -> bool {
    let w = settings.short_window;
    if w == 0 || window.len() <= w {
        return false;
    }
    let short = sorted_finite(&window[window.len() - w..]);
    let (Some(p_short), Some(p_long), Some(std_long)) = (
        percentile_sorted(&short, settings.stability_percentile),
        percentile_sorted(sorted, settings.stability_percentile),
        std_dev(window),
    ) else {
        return false;
    };
    std_long > f64::EPSILON && (p_short - p_long).abs() > settings.regime_drift_multiple * std_long
}

// =============================================================================
// BaselineSet — the read-only view one cycle evaluates against
// =============================================================================

/// Baselines resolved for one (asset, timeframe) at one point in time,
/// keyed by (signal_id, metric).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineSet {
    entries: BTreeMap<String, BTreeMap<String, Baseline>>,
}

impl BaselineSet {
    pub fn insert(&mut self, baseline: Baseline) {
        self.entries
            .entry(baseline.signal_id.clone())
            .or_default()
            .insert(baseline.metric.clone(), baseline);
    }

    pub fn get(&self, signal_id: &str, metric: &str) -> Option<&Baseline> {
        self.entries.get(signal_id)?.get(metric)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// BaselineStore — snapshot table
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct SeriesKey {
    signal_id: String,
    metric: String,
    asset: String,
    timeframe: Timeframe,
}

/// Thread-safe baseline snapshot table keyed by (signal, metric, asset,
/// timeframe, as-of).
pub struct BaselineStore {
    snapshots: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Baseline>>>,
    retained_per_series: usize,
}

impl BaselineStore {
    pub fn new(retained_per_series: usize) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            retained_per_series: retained_per_series.max(1),
        }
    }

    /// Add or replace one snapshot.
    pub fn insert(&self, baseline: Baseline) {
        let key = SeriesKey {
            signal_id: baseline.signal_id.clone(),
            metric: baseline.metric.clone(),
            asset: baseline.asset.clone(),
            timeframe: baseline.timeframe,
        };
        let mut snapshots = self.snapshots.write();
        let series = snapshots.entry(key).or_default();
        series.insert(baseline.as_of, baseline);
        while series.len() > self.retained_per_series {
            series.pop_first();
        }
    }

    /// Recompute every metric baseline of `definitions` for one
    /// (asset, timeframe) from the supplied metric histories. Metrics with no
    /// history still get an (empty, insufficient) snapshot. Returns the
    /// number of snapshots written.
    pub fn recalculate(
        &self,
        asset: &str,
        timeframe: Timeframe,
        as_of: DateTime<Utc>,
        definitions: &[SignalDefinition],
        histories: &BTreeMap<String, Vec<f64>>,
        settings: &BaselineSettings,
    ) -> usize {
        let mut written = 0;
        let mut insufficient = 0;
        let mut regime_changes = 0;
        for def in definitions {
            for metric in def.metrics() {
                let history = histories.get(&metric).map(Vec::as_slice).unwrap_or(&[]);
                let baseline = Baseline::compute(
                    &def.id,
                    &metric,
                    asset,
                    timeframe,
                    as_of,
                    history,
                    def.baseline_lookback_periods,
                    settings,
                );
                if baseline.insufficient {
                    insufficient += 1;
                }
                if baseline.regime_change_detected {
                    regime_changes += 1;
                }
                debug!(
                    signal = %def.id,
                    metric = %metric,
                    sample_size = baseline.sample_size,
                    stability = format!("{:.3}", baseline.stability_score),
                    regime_change = baseline.regime_change_detected,
                    "baseline computed"
                );
                self.insert(baseline);
                written += 1;
            }
        }
        info!(
            asset,
            timeframe = %timeframe,
            as_of = %as_of,
            written,
            insufficient,
            regime_changes,
            "baselines recalculated"
        );
        written
    }

    /// Resolve the newest snapshot at or before `at` for every series of
    /// (asset, timeframe).
    pub fn snapshot_at(&self, asset: &str, timeframe: Timeframe, at: DateTime<Utc>) -> BaselineSet {
        let snapshots = self.snapshots.read();
        let mut set = BaselineSet::default();
        for (key, series) in snapshots.iter() {
            if key.asset != asset || key.timeframe != timeframe {
                continue;
            }
            if let Some((_, baseline)) = series.range(..=at).next_back() {
                set.insert(baseline.clone());
            }
        }
        set
    }

    /// Exact snapshot lookup.
    pub fn get(
        &self,
        signal_id: &str,
        metric: &str,
        asset: &str,
        timeframe: Timeframe,
        as_of: DateTime<Utc>,
    ) -> Option<Baseline> {
        let key = SeriesKey {
            signal_id: signal_id.to_string(),
            metric: metric.to_string(),
            asset: asset.to_string(),
            timeframe,
        };
        self.snapshots.read().get(&key)?.get(&as_of).cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().values().map(BTreeMap::len).sum()
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new(120)
    }
}

impl std::fmt::Debug for BaselineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineStore")
            .field("snapshots", &self.snapshot_count())
            .field("retained_per_series", &self.retained_per_series)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::catalog::default_signals;
    use chrono::{Duration, TimeZone};

    fn settings() -> BaselineSettings {
        BaselineSettings::default()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn linear(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    fn compute(obs: &[f64], lookback: usize) -> Baseline {
        Baseline::compute("s", "m", "BTC", Timeframe::D1, t0(), obs, lookback, &settings())
    }

    #[test]
    fn small_sample_is_insufficient() {
        let b = compute(&linear(10), 90);
        assert!(b.insufficient);
        assert_eq!(b.sample_size, 10);
        assert_eq!(b.min, 1.0);
        assert_eq!(b.max, 10.0);
    }

    #[test]
    fn lookback_keeps_most_recent_observations() {
        let b = compute(&linear(200), 90);
        assert_eq!(b.sample_size, 90);
        assert_eq!(b.min, 111.0);
        assert_eq!(b.max, 200.0);
        assert!(!b.insufficient);
    }

    #[test]
    fn ladder_follows_configured_percentiles() {
        let b = compute(&linear(101), 101);
        let p50 = b.ladder.iter().find(|p| p.percentile == 50.0).unwrap();
        assert_eq!(p50.value, 51.0);
        assert_eq!(b.median, 51.0);
        assert_eq!(b.ladder.len(), settings().percentile_ladder.len());
    }

    #[test]
    fn threshold_interpolates_between_ladder_points() {
        let b = compute(&linear(101), 101);
        // 60 sits between the 50 (51.0) and 75 (76.0) ladder points.
        assert!((b.threshold_at(60.0).unwrap() - 61.0).abs() < 1e-9);
        // below the lowest ladder point clamps to it
        assert_eq!(b.threshold_at(1.0), b.ladder.first().map(|p| p.value));
        assert_eq!(b.threshold_at(100.0), b.ladder.last().map(|p| p.value));
    }

    #[test]
    fn constant_series_is_stable_without_regime_change() {
        let b = compute(&[5.0; 90], 90);
        assert_eq!(b.stability_score, 1.0);
        assert!(!b.regime_change_detected);
        assert_eq!(b.z_score(7.0), None);
    }

    #[test]
    fn level_shift_is_flagged_as_regime_change() {
        let mut obs = vec![100.0; 60];
        obs.extend(std::iter::repeat(10.0).take(30));
        // alternate slightly so dispersion is not degenerate
        for (i, v) in obs.iter_mut().enumerate() {
            *v += (i % 2) as f64;
        }
        let b = compute(&obs, 90);
        assert!(b.regime_change_detected);
        assert!(b.stability_score < 1.0);
    }

    #[test]
    fn empty_history_yields_empty_insufficient_baseline() {
        let b = compute(&[], 90);
        assert!(b.insufficient);
        assert!(b.ladder.is_empty());
        assert_eq!(b.stability_score, 0.0);
        assert_eq!(b.threshold_at(50.0), None);
    }

    #[test]
    fn store_resolves_latest_snapshot_at_or_before() {
        let store = BaselineStore::new(10);
        let defs: Vec<_> = default_signals()
            .into_iter()
            .filter(|d| d.id == "whale_flow_dominance_signal")
            .collect();
        let mut histories = BTreeMap::new();
        histories.insert("whale_volume_share".to_string(), vec![0.3; 40]);
        histories.insert("whale_count_share".to_string(), vec![0.1; 40]);

        let written = store.recalculate("BTC", Timeframe::D1, t0(), &defs, &histories, &settings());
        assert_eq!(written, 2);
        histories.insert("whale_volume_share".to_string(), vec![0.5; 40]);
        store.recalculate(
            "BTC",
            Timeframe::D1,
            t0() + Duration::hours(6),
            &defs,
            &histories,
            &settings(),
        );

        let early = store.snapshot_at("BTC", Timeframe::D1, t0() + Duration::hours(1));
        let b = early.get("whale_flow_dominance_signal", "whale_volume_share").unwrap();
        assert_eq!(b.median, 0.3);

        let late = store.snapshot_at("BTC", Timeframe::D1, t0() + Duration::hours(7));
        let b = late.get("whale_flow_dominance_signal", "whale_volume_share").unwrap();
        assert_eq!(b.median, 0.5);

        assert!(store
            .snapshot_at("BTC", Timeframe::D1, t0() - Duration::hours(1))
            .is_empty());
        assert!(store.snapshot_at("ETH", Timeframe::D1, t0()).is_empty());
    }

    #[test]
    fn store_retention_drops_oldest() {
        let store = BaselineStore::new(2);
        for h in 0..4 {
            let mut b = compute(&linear(40), 90);
            b.as_of = t0() + Duration::hours(h);
            store.insert(b);
        }
        assert_eq!(store.snapshot_count(), 2);
        assert!(store.get("s", "m", "BTC", Timeframe::D1, t0()).is_none());
        assert!(store
            .get("s", "m", "BTC", Timeframe::D1, t0() + Duration::hours(3))
            .is_some());
    }
}
