// =============================================================================
// Engine Configuration — JSON settings with per-field defaults and atomic save
// =============================================================================
//
// Every tunable of the pipeline lives here: symbol selection, upstream
// endpoints, connector pacing, reconnect budget, backfill pacing, and the
// signal rule set.
//
// All fields carry `#[serde(default)]` so an older or partial file always
// loads. Environment variables override the file for deployment-specific
// values (see `apply_env_overrides`).
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::client::DEFAULT_BASE_URL;
use crate::market_data::metrics::DEFAULT_REFERENCE_SYMBOLS;
use crate::market_data::BackfillOptions;
use crate::signals::{default_rules, SignalRule};
use crate::stream::{ConnectorConfig, ReconnectPolicy, DEFAULT_WS_URL, MAX_STREAMS_PER_CONNECTION};

/// Default config file name, resolved relative to the working directory.
pub const CONFIG_FILE: &str = "market_pulse.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_symbols() -> usize {
    200
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_reference_symbols() -> Vec<String> {
    DEFAULT_REFERENCE_SYMBOLS.iter().map(|s| s.to_string()).collect()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_rest_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_rest_timeout_secs() -> u64 {
    10
}

fn default_ticker_wait_secs() -> u64 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_subscribe_chunk_size() -> usize {
    100
}

fn default_subscribe_chunk_delay_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    4096
}

fn default_backfill_batch_size() -> usize {
    10
}

fn default_backfill_batch_delay_ms() -> u64 {
    1000
}

fn default_backfill_limit() -> u32 {
    289
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> Option<u32> {
    Some(10)
}

// =============================================================================
// ReconnectSettings
// =============================================================================

/// Reconnect schedule in file-friendly units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,

    /// `null` retries forever.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            max_attempts: self.max_attempts,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Symbol selection ---------------------------------------------------

    /// Explicit symbol list. Empty selects the top `max_symbols` by 24h
    /// quote volume.
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,

    /// Only pairs quoted in this asset are ranked.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Instruments for dominance ratios; always tracked.
    #[serde(default = "default_reference_symbols")]
    pub reference_symbols: Vec<String>,

    // --- Upstream -----------------------------------------------------------

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_rest_timeout_secs")]
    pub rest_timeout_secs: u64,

    // --- Connector ----------------------------------------------------------

    /// How long start waits for the first ticker batch.
    #[serde(default = "default_ticker_wait_secs")]
    pub ticker_wait_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_subscribe_chunk_size")]
    pub subscribe_chunk_size: usize,

    #[serde(default = "default_subscribe_chunk_delay_ms")]
    pub subscribe_chunk_delay_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Capacity of the connector and engine event channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    // --- Backfill -----------------------------------------------------------

    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: usize,

    #[serde(default = "default_backfill_batch_delay_ms")]
    pub backfill_batch_delay_ms: u64,

    /// Candles requested per symbol.
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: u32,

    // --- Signals ------------------------------------------------------------

    #[serde(default = "default_rules")]
    pub rules: Vec<SignalRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            max_symbols: default_max_symbols(),
            quote_asset: default_quote_asset(),
            reference_symbols: default_reference_symbols(),
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            rest_timeout_secs: default_rest_timeout_secs(),
            ticker_wait_secs: default_ticker_wait_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            subscribe_chunk_size: default_subscribe_chunk_size(),
            subscribe_chunk_delay_ms: default_subscribe_chunk_delay_ms(),
            reconnect: ReconnectSettings::default(),
            event_capacity: default_event_capacity(),
            backfill_batch_size: default_backfill_batch_size(),
            backfill_batch_delay_ms: default_backfill_batch_delay_ms(),
            backfill_limit: default_backfill_limit(),
            rules: default_rules(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            rules = config.rules.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
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

    /// Apply `PULSE_SYMBOLS`, `PULSE_WS_URL`, `PULSE_REST_URL` and
    /// `PULSE_MAX_SYMBOLS` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = var("PULSE_SYMBOLS") {
            self.symbols = parse_symbol_list(&syms);
        }
        if let Some(url) = var("PULSE_WS_URL").filter(|u| !u.trim().is_empty()) {
            self.ws_url = url.trim().to_string();
        }
        if let Some(url) = var("PULSE_REST_URL").filter(|u| !u.trim().is_empty()) {
            self.rest_url = url.trim().to_string();
        }
        if let Some(raw) = var("PULSE_MAX_SYMBOLS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_symbols = n,
                _ => warn!(value = %raw, "ignoring invalid PULSE_MAX_SYMBOLS"),
            }
        }
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            url: self.ws_url.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            reconnect: self.reconnect.policy(),
            subscribe_chunk_size: self.subscribe_chunk_size.max(1),
            subscribe_chunk_delay: Duration::from_millis(self.subscribe_chunk_delay_ms),
            max_streams: MAX_STREAMS_PER_CONNECTION,
            event_capacity: self.event_capacity.max(1),
        }
    }

    pub fn backfill_options(&self) -> BackfillOptions {
        BackfillOptions {
            batch_size: self.backfill_batch_size.max(1),
            batch_delay: Duration::from_millis(self.backfill_batch_delay_ms),
            limit: self.backfill_limit,
        }
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest_timeout_secs.max(1))
    }

    pub fn ticker_wait(&self) -> Duration {
        Duration::from_secs(self.ticker_wait_secs)
    }
}

/// Comma-separated symbols, trimmed and upper-cased; blanks and repeats are
/// dropped.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !sym.is_empty() && !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!(cfg.symbols.is_empty());
        assert_eq!(cfg.max_symbols, 200);
        assert_eq!(cfg.quote_asset, "USDT");
        assert_eq!(cfg.reference_symbols, vec!["BTCUSDT", "ETHUSDT", "PAXGUSDT"]);
        assert_eq!(cfg.backfill_limit, 289);
        assert_eq!(cfg.rules.len(), 4);
        assert_eq!(cfg.reconnect.max_attempts, Some(10));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ws_url, DEFAULT_WS_URL);
        assert_eq!(cfg.rest_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.subscribe_chunk_size, 100);
        assert_eq!(cfg.rules.len(), 4);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "reconnect": { "max_attempts": null }, "rules": [] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.reconnect.max_attempts, None);
        assert_eq!(cfg.reconnect.base_delay_ms, 1000);
        assert!(cfg.rules.is_empty());
        assert_eq!(cfg.max_symbols, 200);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("market-pulse-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);

        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["SOLUSDT".to_string()];
        cfg.backfill_batch_size = 4;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        assert_eq!(loaded.backfill_batch_size, 4);
        assert_eq!(loaded.rules, cfg.rules);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(EngineConfig::load("/nonexistent/market_pulse.json").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PULSE_SYMBOLS", " btcusdt, ethusdt ,,BTCUSDT "),
            ("PULSE_WS_URL", "ws://127.0.0.1:9000/stream"),
            ("PULSE_MAX_SYMBOLS", "oops"),
        ]);
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.ws_url, "ws://127.0.0.1:9000/stream");
        assert_eq!(cfg.rest_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.max_symbols, 200);
    }

    #[test]
    fn derived_settings() {
        let mut cfg = EngineConfig::default();
        cfg.reconnect.max_delay_ms = 10;
        cfg.subscribe_chunk_size = 0;

        let connector = cfg.connector_config();
        assert_eq!(connector.subscribe_chunk_size, 1);
        assert_eq!(connector.reconnect.max_delay, Duration::from_millis(1000));
        assert_eq!(connector.max_streams, MAX_STREAMS_PER_CONNECTION);

        let backfill = cfg.backfill_options();
        assert_eq!(backfill.batch_size, 10);
        assert_eq!(backfill.batch_delay, Duration::from_secs(1));
    }
}
