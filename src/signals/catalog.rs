// =============================================================================
// Default signal catalogue (version 1)
// =============================================================================
//
//   network_health : network_growth (0.6), network_congestion (0.4)
//   capital_flow   : net_utxo_inflow (0.5), whale_flow_dominance (0.5)
//   smart_money    : smart_money_accumulation (0.5), smart_money_distribution (0.5)
//   risk           : abnormal_activity (0.5), capital_concentration (0.5)
// =============================================================================

use crate::signals::definition::{Condition, Predicate, Quorum, SignalDefinition, SignalRule};
use crate::types::{SignalCategory, SignalDirection};

const CATALOGUE_VERSION: u32 = 1;
const DEFAULT_LOOKBACK: usize = 90;

fn cond(metric: &str, predicate: Predicate) -> Condition {
    Condition {
        metric: metric.to_string(),
        predicate,
    }
}

fn boolean(
    id: &str,
    category: SignalCategory,
    direction: SignalDirection,
    weight: f64,
    quorum: usize,
    conditions: Vec<Condition>,
) -> SignalDefinition {
    SignalDefinition {
        id: id.to_string(),
        version: CATALOGUE_VERSION,
        category,
        direction,
        component_weight: weight,
        baseline_lookback_periods: DEFAULT_LOOKBACK,
        rule: SignalRule::Boolean {
            conditions,
            quorum: Quorum::new(quorum),
        },
    }
}

/// The eight on-chain signals shipped with the default configuration.
pub fn default_signals() -> Vec<SignalDefinition> {
    use Predicate::*;
    use SignalCategory::*;
    use SignalDirection::*;

    vec![
        boolean(
            "network_growth_signal",
            NetworkHealth,
            Accumulation,
            0.6,
            2,
            vec![
                cond("active_addresses", AbovePercentile { percentile: 75.0 }),
                cond("tx_count", AbovePercentile { percentile: 75.0 }),
                cond("new_addresses", AbovePercentile { percentile: 75.0 }),
            ],
        ),
        boolean(
            "network_congestion_signal",
            NetworkHealth,
            Distribution,
            0.4,
            2,
            vec![
                cond("avg_fee", AbovePercentile { percentile: 90.0 }),
                cond("confirmation_time", AbovePercentile { percentile: 90.0 }),
                cond("mempool_size", AbovePercentile { percentile: 85.0 }),
            ],
        ),
        boolean(
            "net_utxo_inflow_signal",
            CapitalFlow,
            Accumulation,
            0.5,
            2,
            vec![
                cond("net_utxo_flow", AbovePercentile { percentile: 70.0 }),
                cond("utxo_creation_ratio", AboveRatio { threshold: 1.1 }),
            ],
        ),
        boolean(
            "whale_flow_dominance_signal",
            CapitalFlow,
            Distribution,
            0.5,
            1,
            vec![
                cond("whale_volume_share", AboveRatio { threshold: 0.4 }),
                cond("whale_count_share", AboveRatio { threshold: 0.15 }),
            ],
        ),
        boolean(
            "smart_money_accumulation_signal",
            SmartMoney,
            Accumulation,
            0.5,
            2,
            vec![
                cond("smart_net_flow", AbovePercentile { percentile: 60.0 }),
                cond("smart_volume", AbovePercentile { percentile: 70.0 }),
                cond("smart_active_addresses", AbovePercentile { percentile: 65.0 }),
            ],
        ),
        boolean(
            "smart_money_distribution_signal",
            SmartMoney,
            Distribution,
            0.5,
            2,
            vec![
                cond("smart_net_flow", BelowPercentile { percentile: 40.0 }),
                cond("smart_spending", AbovePercentile { percentile: 75.0 }),
                cond("smart_holding_ratio", BelowPercentile { percentile: 30.0 }),
            ],
        ),
        boolean(
            "abnormal_activity_signal",
            Risk,
            Neutral,
            0.5,
            1,
            vec![
                cond(
                    "tx_count",
                    OutsidePercentileBand {
                        lower: 5.0,
                        upper: 95.0,
                    },
                ),
                cond("tx_count", ZScoreBeyond { threshold: 3.0 }),
            ],
        ),
        SignalDefinition {
            id: "capital_concentration_signal".to_string(),
            version: CATALOGUE_VERSION,
            category: Risk,
            direction: Neutral,
            component_weight: 0.5,
            baseline_lookback_periods: DEFAULT_LOOKBACK,
            rule: SignalRule::Continuous {
                metric: "gini_concentration".to_string(),
                invert: false,
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn catalogue_is_valid() {
        for def in default_signals() {
            def.validate().unwrap();
        }
    }

    #[test]
    fn weights_sum_to_one_per_category() {
        let mut sums: HashMap<SignalCategory, f64> = HashMap::new();
        for def in default_signals() {
            *sums.entry(def.category).or_default() += def.component_weight;
        }
        assert_eq!(sums.len(), 4);
        for (cat, sum) in sums {
            assert!((sum - 1.0).abs() < 1e-9, "{cat} sums to {sum}");
        }
    }

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<String> = default_signals().into_iter().map(|d| d.id).collect();
        let n = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), n);
    }
}
