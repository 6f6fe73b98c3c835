// =============================================================================
// Engine Configuration — versioned, immutable-per-cycle settings
// =============================================================================
//
// Every tunable of the scoring engine lives here: category caps, bias cut
// points, confidence weights, gate thresholds, baseline parameters and the
// signal catalogue itself.
//
// A loaded config is wrapped in `Arc` and never mutated while a cycle holds
// it; reloading swaps in a new `Arc`. Persistence uses the tmp + rename
// pattern. All fields carry serde defaults so an empty `{}` is a complete,
// valid configuration.
//
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::hashing::canonical_hash;
use crate::errors::EngineError;
use crate::signals::catalog::default_signals;
use crate::signals::SignalDefinition;
use crate::types::{SignalCategory, Timeframe};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "ONCHAIN_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "engine_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_config_version() -> u32 {
    1
}

fn default_assets() -> Vec<String> {
    vec!["BTC".to_string()]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::H1, Timeframe::H4, Timeframe::D1]
}

fn default_quarter() -> f64 {
    0.25
}

fn default_historical_window() -> usize {
    10
}

fn default_cycle_timeout_ms() -> u64 {
    5_000
}

fn default_confidence_drop_threshold() -> f64 {
    0.3
}

fn default_min_sample_size() -> usize {
    30
}

fn default_short_window() -> usize {
    30
}

fn default_stability_points() -> usize {
    10
}

fn default_stability_percentile() -> f64 {
    90.0
}

fn default_regime_drift_multiple() -> f64 {
    2.0
}

fn default_percentile_ladder() -> Vec<f64> {
    vec![5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 95.0, 99.0, 99.9]
}

fn default_six_hours() -> u64 {
    21_600
}

fn default_retained_snapshots() -> usize {
    120
}

fn default_margin_half_saturation() -> f64 {
    0.5
}

fn default_min_confidence() -> f64 {
    0.60
}

fn default_min_stability() -> f64 {
    0.70
}

fn default_min_completeness() -> f64 {
    0.80
}

fn default_max_conflicting_signals() -> usize {
    2
}

fn default_max_data_age_secs() -> u64 {
    7_200
}

// =============================================================================
// CategoryCaps
// =============================================================================

/// Maximum points per category. `risk` is the maximum penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCaps {
    #[serde(default = "CategoryCaps::default_thirty")]
    pub network_health: f64,
    #[serde(default = "CategoryCaps::default_thirty")]
    pub capital_flow: f64,
    #[serde(default = "CategoryCaps::default_forty")]
    pub smart_money: f64,
    #[serde(default = "CategoryCaps::default_twenty")]
    pub risk: f64,
}

impl CategoryCaps {
    fn default_thirty() -> f64 {
        30.0
    }
    fn default_forty() -> f64 {
        40.0
    }
    fn default_twenty() -> f64 {
        20.0
    }

    pub fn cap(&self, category: SignalCategory) -> f64 {
        match category {
            SignalCategory::NetworkHealth => self.network_health,
            SignalCategory::CapitalFlow => self.capital_flow,
            SignalCategory::SmartMoney => self.smart_money,
            SignalCategory::Risk => self.risk,
        }
    }
}

impl Default for CategoryCaps {
    fn default() -> Self {
        Self {
            network_health: 30.0,
            capital_flow: 30.0,
            smart_money: 40.0,
            risk: 20.0,
        }
    }
}

// =============================================================================
// BiasThresholds
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasThresholds {
    /// Scores strictly above this are `positive`.
    #[serde(default = "BiasThresholds::default_positive")]
    pub positive_above: f64,
    /// Scores strictly below this are `negative`.
    #[serde(default = "BiasThresholds::default_negative")]
    pub negative_below: f64,
}

impl BiasThresholds {
    fn default_positive() -> f64 {
        60.0
    }
    fn default_negative() -> f64 {
        40.0
    }
}

impl Default for BiasThresholds {
    fn default() -> Self {
        Self {
            positive_above: 60.0,
            negative_below: 40.0,
        }
    }
}

// =============================================================================
// ConfidenceWeights
// =============================================================================

/// Weights of the four sub-confidences. Normalised by their sum at use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    #[serde(default = "default_quarter")]
    pub signal_agreement: f64,
    #[serde(default = "default_quarter")]
    pub historical_stability: f64,
    #[serde(default = "default_quarter")]
    pub data_quality: f64,
    #[serde(default = "default_quarter")]
    pub statistical_significance: f64,
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.signal_agreement
            + self.historical_stability
            + self.data_quality
            + self.statistical_significance
    }

    fn as_array(&self) -> [f64; 4] {
        [
            self.signal_agreement,
            self.historical_stability,
            self.data_quality,
            self.statistical_significance,
        ]
    }
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            signal_agreement: 0.25,
            historical_stability: 0.25,
            data_quality: 0.25,
            statistical_significance: 0.25,
        }
    }
}

// =============================================================================
// GateThresholds
// =============================================================================

/// Thresholds of the Decision Gate rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Below this overall confidence the artifact is BLOCKED.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Below this result stability the artifact is DEGRADED.
    #[serde(default = "default_min_stability")]
    pub min_stability: f64,
    /// Below this data completeness the artifact is DEGRADED.
    #[serde(default = "default_min_completeness")]
    pub min_completeness: f64,
    /// More conflicting pairs than this degrade the artifact.
    #[serde(default = "default_max_conflicting_signals")]
    pub max_conflicting_signals: usize,
    /// Upstream lag beyond this blocks the artifact as stale.
    #[serde(default = "default_max_data_age_secs")]
    pub max_data_age_secs: u64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_stability: default_min_stability(),
            min_completeness: default_min_completeness(),
            max_conflicting_signals: default_max_conflicting_signals(),
            max_data_age_secs: default_max_data_age_secs(),
        }
    }
}

// =============================================================================
// BaselineSettings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineSettings {
    /// Samples below this mark a baseline `insufficient`.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
    /// Length of the short window used for stability and drift.
    #[serde(default = "default_short_window")]
    pub short_window: usize,
    /// Number of rolling short-window percentiles fed into the CV.
    #[serde(default = "default_stability_points")]
    pub stability_points: usize,
    #[serde(default = "default_stability_percentile")]
    pub stability_percentile: f64,
    #[serde(default = "default_regime_drift_multiple")]
    pub regime_drift_multiple: f64,
    #[serde(default = "default_percentile_ladder")]
    pub percentile_ladder: Vec<f64>,
    #[serde(default = "default_six_hours")]
    pub recalc_interval_secs: u64,
    #[serde(default = "default_six_hours")]
    pub cache_ttl_secs: u64,
    /// Snapshots kept per (signal, metric, asset, timeframe).
    #[serde(default = "default_retained_snapshots")]
    pub retained_snapshots: usize,
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            short_window: default_short_window(),
            stability_points: default_stability_points(),
            stability_percentile: default_stability_percentile(),
            regime_drift_multiple: default_regime_drift_multiple(),
            percentile_ladder: default_percentile_ladder(),
            recalc_interval_secs: default_six_hours(),
            cache_ttl_secs: default_six_hours(),
            retained_snapshots: default_retained_snapshots(),
        }
    }
}

// =============================================================================
// EvaluatorSettings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSettings {
    /// Standardised margin at which the margin factor reaches 0.5.
    #[serde(default = "default_margin_half_saturation")]
    pub margin_half_saturation: f64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            margin_half_saturation: default_margin_half_saturation(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration of the scoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    // --- Universe ----------------------------------------------------------
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    // --- Scoring -----------------------------------------------------------
    #[serde(default)]
    pub category_caps: CategoryCaps,
    #[serde(default)]
    pub bias: BiasThresholds,
    #[serde(default)]
    pub confidence_weights: ConfidenceWeights,
    /// N for the bias-flip historical stability measure.
    #[serde(default = "default_historical_window")]
    pub historical_window: usize,

    // --- Gate --------------------------------------------------------------
    #[serde(default)]
    pub gate: GateThresholds,

    // --- Baselines & evaluation -------------------------------------------
    #[serde(default)]
    pub baseline: BaselineSettings,
    #[serde(default)]
    pub evaluator: EvaluatorSettings,

    // --- Cycle ---------------------------------------------------------------
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
    /// A confidence fall larger than this versus the previous cycle is
    /// recorded as an anomaly.
    #[serde(default = "default_confidence_drop_threshold")]
    pub confidence_drop_threshold: f64,

    #[serde(default = "default_signals")]
    pub signals: Vec<SignalDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            assets: default_assets(),
            timeframes: default_timeframes(),
            category_caps: CategoryCaps::default(),
            bias: BiasThresholds::default(),
            confidence_weights: ConfidenceWeights::default(),
            historical_window: default_historical_window(),
            gate: GateThresholds::default(),
            baseline: BaselineSettings::default(),
            evaluator: EvaluatorSettings::default(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            confidence_drop_threshold: default_confidence_drop_threshold(),
            signals: default_signals(),
        }
    }
}

fn unit_interval(name: &str, v: f64) -> Result<(), EngineError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(EngineError::Config(format!("{name} = {v} outside [0, 1]")))
    }
}

impl EngineConfig {
    /// Resolve the config path from `ONCHAIN_CONFIG_PATH`, falling back to
    /// `engine_config.json` in the working directory.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load and validate configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("engine config at {} is invalid", path.display()))?;

        config.log_summary(&path.display().to_string());
        Ok(config)
    }

    /// Persist the configuration to `path` (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Log the effective configuration, including the confidence weighting.
    pub fn log_summary(&self, source: &str) {
        let w = &self.confidence_weights;
        info!(
            source,
            config_version = self.config_version,
            config_hash = %self.config_hash(),
            assets = ?self.assets,
            timeframes = ?self.timeframes.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            signals = self.signals.len(),
            w_agreement = w.signal_agreement,
            w_stability = w.historical_stability,
            w_data_quality = w.data_quality,
            w_significance = w.statistical_significance,
            min_confidence = self.gate.min_confidence,
            "engine config loaded"
        );
        for category in SignalCategory::ALL {
            let ids: Vec<&str> = self.signals_in(category).map(|d| d.id.as_str()).collect();
            debug!(category = %category, signals = ?ids, "signal catalogue");
        }
    }

    /// Canonical hash of the whole configuration.
    pub fn config_hash(&self) -> String {
        canonical_hash(self)
    }

    pub fn signals_in(&self, category: SignalCategory) -> impl Iterator<Item = &SignalDefinition> {
        self.signals.iter().filter(move |s| s.category == category)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.assets.is_empty() {
            return Err(EngineError::Config("no assets configured".into()));
        }
        if self.timeframes.is_empty() {
            return Err(EngineError::Config("no timeframes configured".into()));
        }

        for category in SignalCategory::ALL {
            let cap = self.category_caps.cap(category);
            if !cap.is_finite() || cap < 0.0 {
                return Err(EngineError::Config(format!("cap for {category} must be >= 0")));
            }
        }

        if self.bias.negative_below > self.bias.positive_above {
            return Err(EngineError::Config(format!(
                "bias negative_below {} exceeds positive_above {}",
                self.bias.negative_below, self.bias.positive_above
            )));
        }

        let weights = self.confidence_weights.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::Config("confidence weights must be >= 0".into()));
        }
        if self.confidence_weights.sum() <= 0.0 {
            return Err(EngineError::Config("confidence weights sum to zero".into()));
        }

        unit_interval("gate.min_confidence", self.gate.min_confidence)?;
        unit_interval("gate.min_stability", self.gate.min_stability)?;
        unit_interval("gate.min_completeness", self.gate.min_completeness)?;
        unit_interval("confidence_drop_threshold", self.confidence_drop_threshold)?;

        if self.historical_window == 0 {
            return Err(EngineError::Config("historical_window must be > 0".into()));
        }
        if self.cycle_timeout_ms == 0 {
            return Err(EngineError::Config("cycle_timeout_ms must be > 0".into()));
        }

        let b = &self.baseline;
        if b.percentile_ladder.is_empty() {
            return Err(EngineError::Config("percentile ladder is empty".into()));
        }
        if b.percentile_ladder.windows(2).any(|w| w[0] >= w[1])
            || b.percentile_ladder.iter().any(|p| !(0.0..=100.0).contains(p))
        {
            return Err(EngineError::Config(
                "percentile ladder must be strictly ascending within [0, 100]".into(),
            ));
        }
        if b.short_window == 0 || b.min_sample_size == 0 {
            return Err(EngineError::Config(
                "baseline short_window and min_sample_size must be > 0".into(),
            ));
        }
        let half = self.evaluator.margin_half_saturation;
        if !half.is_finite() || half <= 0.0 {
            return Err(EngineError::Config("margin_half_saturation must be > 0".into()));
        }

        let mut ids = HashSet::new();
        for def in &self.signals {
            def.validate().map_err(EngineError::Config)?;
            if !ids.insert(def.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate signal id {}", def.id)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::definition::{Quorum, SignalRule};

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.config_version, 1);
        assert_eq!(cfg.assets, vec!["BTC"]);
        assert_eq!(cfg.timeframes.len(), 3);
        assert_eq!(cfg.category_caps.smart_money, 40.0);
        assert_eq!(cfg.category_caps.risk, 20.0);
        assert_eq!(cfg.bias.positive_above, 60.0);
        assert_eq!(cfg.gate.max_conflicting_signals, 2);
        assert_eq!(cfg.baseline.min_sample_size, 30);
        assert_eq!(cfg.baseline.percentile_ladder.len(), 9);
        assert_eq!(cfg.signals.len(), 8);
        assert!((cfg.confidence_weights.sum() - 1.0).abs() < f64::EPSILON);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "assets": ["ETH"], "gate": { "min_confidence": 0.7 } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.assets, vec!["ETH"]);
        assert_eq!(cfg.gate.min_confidence, 0.7);
        assert_eq!(cfg.gate.min_completeness, 0.80);
        assert_eq!(cfg.cycle_timeout_ms, 5_000);
    }

    #[test]
    fn config_hash_tracks_content() {
        let a = EngineConfig::default();
        let mut b = EngineConfig::default();
        assert_eq!(a.config_hash(), b.config_hash());
        b.gate.min_confidence = 0.65;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn validation_rejects_bad_weights_and_thresholds() {
        let mut cfg = EngineConfig::default();
        cfg.confidence_weights = ConfidenceWeights {
            signal_agreement: 0.0,
            historical_stability: 0.0,
            data_quality: 0.0,
            statistical_significance: 0.0,
        };
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.gate.min_completeness = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.bias.negative_below = 70.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_duplicate_ids_and_bad_quorum() {
        let mut cfg = EngineConfig::default();
        let dup = cfg.signals[0].clone();
        cfg.signals.push(dup);
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        if let SignalRule::Boolean { quorum, .. } = &mut cfg.signals[0].rule {
            *quorum = Quorum::new(0);
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("onchain-gate-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.assets = vec!["BTC".into(), "ETH".into()];
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.assets, cfg.assets);
        assert_eq!(loaded.config_hash(), cfg.config_hash());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
