// =============================================================================
// Signal Engine — stateless rule evaluation
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rules::{Severity, SignalRule};
use crate::market_data::PartialChangeMetrics;

/// A fired rule for one symbol at one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// `<rule id>:<symbol>:<snapshot timestamp>`; identical inputs give
    /// identical ids so downstream consumers can dedupe.
    pub id: String,
    pub symbol: String,
    pub rule_type: String,
    pub severity: Severity,
    /// The rule's `value_metric` at the time it fired.
    pub value: Option<f64>,
    pub timestamp: i64,
}

pub struct SignalEngine;

impl SignalEngine {
    /// Evaluate `rules` against one symbol's snapshot. Holds no state between
    /// calls; cooldowns and deduplication belong downstream.
    pub fn evaluate(snapshot: &PartialChangeMetrics, rules: &[SignalRule]) -> Vec<Signal> {
        let signals: Vec<Signal> = rules
            .iter()
            .filter(|rule| rule.applies_to(&snapshot.symbol))
            .filter(|rule| rule.matches(snapshot))
            .map(|rule| Signal {
                id: format!("{}:{}:{}", rule.id, snapshot.symbol, snapshot.timestamp),
                symbol: snapshot.symbol.clone(),
                rule_type: rule.rule_type.clone(),
                severity: rule.severity,
                value: rule.value_metric.value(snapshot),
                timestamp: snapshot.timestamp,
            })
            .collect();

        if !signals.is_empty() {
            debug!(
                symbol = %snapshot.symbol,
                fired = signals.len(),
                "signal rules fired"
            );
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{Timeframe, WindowMetrics};
    use crate::signals::rules::{default_rules, Condition, Metric};

    fn w(pct: f64, quote_volume: f64) -> WindowMetrics {
        WindowMetrics {
            price_change: pct,
            price_change_percent: pct,
            base_volume: 0.0,
            quote_volume,
            window_start: 0,
            window_end: 0,
            candle_count: 1,
        }
    }

    fn snapshot(h1: Option<WindowMetrics>) -> PartialChangeMetrics {
        PartialChangeMetrics {
            symbol: "ARBUSDT".to_string(),
            last_price: Some(1.0),
            timestamp: 1_700_000_299_999,
            candle_count: 12,
            m5: Some(w(0.6, 200_000.0)),
            m15: Some(w(2.2, 600_000.0)),
            h1,
            h4: None,
            h8: None,
            h12: None,
            d1: None,
        }
    }

    #[test]
    fn warming_timeframe_blocks_rule() {
        // 1h > 15m cannot be decided while 1h is warming up, even though
        // every other condition holds.
        let rules = default_rules();
        assert!(SignalEngine::evaluate(&snapshot(None), &rules).is_empty());

        let fired = SignalEngine::evaluate(&snapshot(Some(w(4.0, 1_500_000.0))), &rules);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule_type, "momentum_burst_long");
        assert_eq!(fired[0].severity, Severity::High);
        assert_eq!(fired[0].value, Some(2.2));
        assert_eq!(fired[0].id, "momentum_burst_long:ARBUSDT:1700000299999");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = default_rules();
        let snap = snapshot(Some(w(4.0, 1_500_000.0)));
        let first = SignalEngine::evaluate(&snap, &rules);
        let second = SignalEngine::evaluate(&snap, &rules);
        assert_eq!(first, second);
    }

    #[test]
    fn disabled_and_filtered_rules_are_skipped() {
        let mut rules = default_rules();
        let snap = snapshot(Some(w(4.0, 1_500_000.0)));

        rules[0].enabled_symbols = vec!["BTCUSDT".to_string()];
        assert!(SignalEngine::evaluate(&snap, &rules).is_empty());

        rules[0].enabled_symbols.clear();
        rules[0].enabled = false;
        assert!(SignalEngine::evaluate(&snap, &rules).is_empty());
    }

    #[test]
    fn all_matching_rules_fire() {
        let always = SignalRule {
            id: "any_move".to_string(),
            rule_type: "watch".to_string(),
            conditions: vec![Condition::Above {
                metric: Metric::QuoteVolume(Timeframe::M5),
                threshold: 0.0,
            }],
            severity: Severity::Low,
            enabled: true,
            enabled_symbols: Vec::new(),
            value_metric: Metric::ChangePercent(Timeframe::D1),
        };
        let mut rules = default_rules();
        rules.push(always);

        let fired = SignalEngine::evaluate(&snapshot(Some(w(4.0, 1_500_000.0))), &rules);
        let types: Vec<&str> = fired.iter().map(|s| s.rule_type.as_str()).collect();
        assert_eq!(types, vec!["momentum_burst_long", "watch"]);
        // Value metric still warming up.
        assert_eq!(fired[1].value, None);
    }
}
