// =============================================================================
// Shared types used across the on-chain decision engine
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signal category. Three positive categories feed the composite score; the
/// risk category is a deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    NetworkHealth,
    CapitalFlow,
    SmartMoney,
    Risk,
}

impl SignalCategory {
    pub const ALL: [SignalCategory; 4] = [
        Self::NetworkHealth,
        Self::CapitalFlow,
        Self::SmartMoney,
        Self::Risk,
    ];

    pub fn is_penalty(self) -> bool {
        matches!(self, Self::Risk)
    }
}

impl std::fmt::Display for SignalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkHealth => write!(f, "network_health"),
            Self::CapitalFlow => write!(f, "capital_flow"),
            Self::SmartMoney => write!(f, "smart_money"),
            Self::Risk => write!(f, "risk"),
        }
    }
}

/// Whether a signal produces a boolean verdict or a continuous intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Boolean,
    Continuous,
}

/// Directional interpretation of a signal when it fires. Used to count
/// conflicting pairs inside a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Accumulation,
    Distribution,
    Neutral,
}

impl Default for SignalDirection {
    fn default() -> Self {
        Self::Neutral
    }
}

/// Directional bias derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    Positive,
    Neutral,
    Negative,
}

impl Default for Bias {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Neutral => write!(f, "neutral"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

/// Usage state of a decision artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Active,
    Degraded,
    Blocked,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Analysis timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Length of one period.
    pub fn period(self) -> Duration {
        match self {
            Self::H1 => Duration::from_secs(3_600),
            Self::H4 => Duration::from_secs(4 * 3_600),
            Self::D1 => Duration::from_secs(24 * 3_600),
        }
    }

    /// How often the scheduler re-evaluates this timeframe.
    pub fn schedule_interval(self) -> Duration {
        match self {
            Self::H1 => Duration::from_secs(300),
            Self::H4 => Duration::from_secs(1_200),
            Self::D1 => Duration::from_secs(3_600),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Floor `ts` to the start of its period.
    pub fn align(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.period().as_secs() as i64;
        let floored = ts.timestamp().div_euclid(secs) * secs;
        DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(ts)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(format!("unknown timeframe '{other}'")),
        }
    }
}

/// Identity of one evaluation cycle and of its stored result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScoreKey {
    pub asset: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
}

impl ScoreKey {
    pub fn new(asset: impl Into<String>, timeframe: Timeframe, timestamp: DateTime<Utc>) -> Self {
        Self {
            asset: asset.into(),
            timeframe,
            timestamp,
        }
    }

    /// The (asset, timeframe) stream this key belongs to.
    pub fn stream(&self) -> StreamKey {
        StreamKey {
            asset: self.asset.clone(),
            timeframe: self.timeframe,
        }
    }
}

impl std::fmt::Display for ScoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.asset, self.timeframe, self.timestamp.to_rfc3339())
    }
}

/// An (asset, timeframe) stream; cycles inside one stream are ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub asset: String,
    pub timeframe: Timeframe,
}
