// =============================================================================
// Signal Rules — declarative multi-condition predicates over a metrics snapshot
// =============================================================================
//
// A rule fires when every one of its conditions holds. Conditions compare
// timeframe fields of a `PartialChangeMetrics` snapshot: fixed thresholds,
// orderings between two timeframes, and volume ratios. Any condition that
// touches a timeframe still warming up evaluates to `None` ("not met").
//
// Rules are plain serde data so they can be loaded from configuration.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::{PartialChangeMetrics, Timeframe};

/// A numeric field of one timeframe window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "timeframe", rename_all = "snake_case")]
pub enum Metric {
    /// First-to-last close change over the window. The 5m window holds a
    /// single candle, so `ChangePercent(Timeframe::M5)` is always 0; use
    /// `M15` or longer for price movement.
    ChangePercent(Timeframe),
    QuoteVolume(Timeframe),
    BaseVolume(Timeframe),
}

impl Metric {
    /// Read the metric from `snapshot`, `None` during warm-up.
    pub fn value(self, snapshot: &PartialChangeMetrics) -> Option<f64> {
        match self {
            Self::ChangePercent(tf) => snapshot.get(tf).map(|w| w.price_change_percent),
            Self::QuoteVolume(tf) => snapshot.get(tf).map(|w| w.quote_volume),
            Self::BaseVolume(tf) => snapshot.get(tf).map(|w| w.base_volume),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// `metric > threshold`
    Above { metric: Metric, threshold: f64 },
    /// `metric < threshold`
    Below { metric: Metric, threshold: f64 },
    /// `left > right`
    Greater { left: Metric, right: Metric },
    /// `left < right`
    Less { left: Metric, right: Metric },
    /// `left >= right * ratio`
    AtLeastRatio { left: Metric, right: Metric, ratio: f64 },
}

impl Condition {
    /// `Some(result)` when every referenced timeframe is available.
    pub fn evaluate(&self, snapshot: &PartialChangeMetrics) -> Option<bool> {
        let met = match self {
            Self::Above { metric, threshold } => metric.value(snapshot)? > *threshold,
            Self::Below { metric, threshold } => metric.value(snapshot)? < *threshold,
            Self::Greater { left, right } => left.value(snapshot)? > right.value(snapshot)?,
            Self::Less { left, right } => left.value(snapshot)? < right.value(snapshot)?,
            Self::AtLeastRatio { left, right, ratio } => {
                left.value(snapshot)? >= right.value(snapshot)? * ratio
            }
        };
        Some(met)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRule {
    pub id: String,
    /// Category reported on fired signals, e.g. `momentum_burst_long`.
    pub rule_type: String,
    pub conditions: Vec<Condition>,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Symbols this rule applies to. Empty means every symbol.
    #[serde(default)]
    pub enabled_symbols: Vec<String>,
    /// Metric reported as the signal's value.
    pub value_metric: Metric,
}

impl SignalRule {
    pub fn applies_to(&self, symbol: &str) -> bool {
        self.enabled
            && (self.enabled_symbols.is_empty()
                || self.enabled_symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)))
    }

    /// True iff every condition is available and holds. A rule without
    /// conditions never fires.
    pub fn matches(&self, snapshot: &PartialChangeMetrics) -> bool {
        !self.conditions.is_empty()
            && self
                .conditions
                .iter()
                .all(|c| c.evaluate(snapshot) == Some(true))
    }
}

// ---------------------------------------------------------------------------
// Built-in rule set
// ---------------------------------------------------------------------------

const BURST_MIN_CHANGE_PCT: f64 = 1.5;
const BURST_MIN_QUOTE_VOLUME: f64 = 400_000.0;
const REVERSAL_MIN_PRIOR_MOVE_PCT: f64 = 3.0;
const REVERSAL_MIN_RECOVERY_PCT: f64 = 0.5;
const REVERSAL_MIN_QUOTE_VOLUME: f64 = 250_000.0;

fn rule(id: &str, conditions: Vec<Condition>, severity: Severity, value_metric: Metric) -> SignalRule {
    SignalRule {
        id: id.to_string(),
        rule_type: id.to_string(),
        conditions,
        severity,
        enabled: true,
        enabled_symbols: Vec::new(),
        value_metric,
    }
}

/// Momentum bursts (accelerating 15m move backed by volume) and trend
/// reversals (a 1h turn against the 4h trend).
///
/// None of them read the 5m price change, which is always 0.
pub fn default_rules() -> Vec<SignalRule> {
    use Metric::{ChangePercent, QuoteVolume};
    use Timeframe::{H1, H4, M15};

    // 15m volume must carry at least a third of the whole hour.
    let volume_surge = |min: f64| {
        vec![
            Condition::Above {
                metric: QuoteVolume(M15),
                threshold: min,
            },
            Condition::AtLeastRatio {
                left: QuoteVolume(M15),
                right: QuoteVolume(H1),
                ratio: 1.0 / 3.0,
            },
        ]
    };

    let mut burst_long = vec![
        Condition::Above {
            metric: ChangePercent(M15),
            threshold: BURST_MIN_CHANGE_PCT,
        },
        Condition::Greater {
            left: ChangePercent(H1),
            right: ChangePercent(M15),
        },
    ];
    burst_long.extend(volume_surge(BURST_MIN_QUOTE_VOLUME));

    let mut burst_short = vec![
        Condition::Below {
            metric: ChangePercent(M15),
            threshold: -BURST_MIN_CHANGE_PCT,
        },
        Condition::Less {
            left: ChangePercent(H1),
            right: ChangePercent(M15),
        },
    ];
    burst_short.extend(volume_surge(BURST_MIN_QUOTE_VOLUME));

    let mut reversal_bull = vec![
        Condition::Below {
            metric: ChangePercent(H4),
            threshold: -REVERSAL_MIN_PRIOR_MOVE_PCT,
        },
        Condition::Above {
            metric: ChangePercent(H1),
            threshold: REVERSAL_MIN_RECOVERY_PCT,
        },
        Condition::Above {
            metric: ChangePercent(M15),
            threshold: 0.0,
        },
    ];
    reversal_bull.extend(volume_surge(REVERSAL_MIN_QUOTE_VOLUME));

    let mut reversal_bear = vec![
        Condition::Above {
            metric: ChangePercent(H4),
            threshold: REVERSAL_MIN_PRIOR_MOVE_PCT,
        },
        Condition::Below {
            metric: ChangePercent(H1),
            threshold: -REVERSAL_MIN_RECOVERY_PCT,
        },
        Condition::Below {
            metric: ChangePercent(M15),
            threshold: 0.0,
        },
    ];
    reversal_bear.extend(volume_surge(REVERSAL_MIN_QUOTE_VOLUME));

    vec![
        rule("momentum_burst_long", burst_long, Severity::High, ChangePercent(M15)),
        rule("momentum_burst_short", burst_short, Severity::High, ChangePercent(M15)),
        rule("trend_reversal_bullish", reversal_bull, Severity::Medium, ChangePercent(H1)),
        rule("trend_reversal_bearish", reversal_bear, Severity::Medium, ChangePercent(H1)),
    ]
}
