// =============================================================================
// Signals Module
// =============================================================================
//
// Declarative trading-signal rules and the stateless engine that evaluates
// them against per-symbol metrics snapshots.

pub mod engine;
pub mod rules;

pub use engine::{Signal, SignalEngine};
pub use rules::{default_rules, Condition, Metric, Severity, SignalRule};
