// =============================================================================
// Stream Orchestrator — sequences connector, buffers, metrics and signals
// =============================================================================
//
// Start-up sequence:
//   1. Connect and subscribe to the aggregate ticker stream; wait for the
//      first batch (bounded by `ticker_wait`).
//   2. Emit `TickersReady` so consumers can show live prices immediately.
//   3. Select symbols and initialise their candle buffers.
//   4. Backfill history in the background (progress + completion events).
//   5. Subscribe to every symbol's 5m kline stream.
//   6. Steady state: each finalized candle -> buffer -> metrics snapshot ->
//      `MetricsUpdate` -> rule evaluation -> `Signal` events.
//
// Klines reach the buffers through the connector's bounded kline feed, never
// through the lossy broadcast, so a slow pump delays candles instead of
// dropping them.
//
// Exhausting the connector's reconnect budget is the only fatal condition; it
// is surfaced as `Fatal` (and through `wait_fatal`) and requires a restart.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::market_data::buffer_manager::KlineSource;
use crate::market_data::ticker::top_by_quote_volume;
use crate::market_data::timeframe::BASE_INTERVAL;
use crate::market_data::{
    BackfillOptions, BackfillReport, BufferManager, DominanceRatios, MetricsCalculator,
    PartialChangeMetrics, Ticker, Timeframe, WarmupStatus,
};
use crate::runtime_config::EngineConfig;
use crate::signals::{Signal, SignalEngine, SignalRule};
use crate::stream::{kline_stream, ConnectorEvent, KlineUpdate, StreamConnector, TICKER_ARRAY_STREAM};
use crate::types::{now_ms, ConnectionState};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the engine publishes to downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// First ticker batch received; live prices are available.
    TickersReady { count: usize },
    /// Full current ticker snapshot, sorted by symbol.
    TickerUpdate { tickers: Arc<Vec<Ticker>> },
    BackfillProgress { completed: usize, total: usize },
    BackfillComplete(BackfillReport),
    MetricsUpdate {
        symbol: String,
        metrics: PartialChangeMetrics,
        timestamp: i64,
    },
    Signal(Signal),
    ConnectionChanged { state: ConnectionState },
    /// The session cannot recover on its own.
    Fatal { reason: String },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Explicit symbols; empty ranks tickers by 24h quote volume.
    pub symbols: Vec<String>,
    pub max_symbols: usize,
    /// Restrict ranking to pairs quoted in this asset.
    pub quote_asset: Option<String>,
    pub ticker_wait: Duration,
    pub backfill: BackfillOptions,
    pub rules: Vec<SignalRule>,
    pub event_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            max_symbols: 200,
            quote_asset: Some("USDT".to_string()),
            ticker_wait: Duration::from_secs(5),
            backfill: BackfillOptions::default(),
            rules: crate::signals::default_rules(),
            event_capacity: 4096,
        }
    }
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        let quote = config.quote_asset.trim().to_uppercase();
        Self {
            symbols: config.symbols.clone(),
            max_symbols: config.max_symbols,
            quote_asset: (!quote.is_empty()).then_some(quote),
            ticker_wait: config.ticker_wait(),
            backfill: config.backfill_options(),
            rules: config.rules.clone(),
            event_capacity: config.event_capacity.max(1),
        }
    }
}

/// Pick the tracked symbol set.
///
/// An explicit list wins; otherwise tickers are ranked by quote volume and the
/// top `max_symbols` taken. Reference instruments are always appended. When
/// the set exceeds `stream_limit`, non-reference symbols are dropped from the
/// tail first.
pub fn select_symbols(
    explicit: &[String],
    tickers: &[Ticker],
    quote_asset: Option<&str>,
    max_symbols: usize,
    references: &[String],
    stream_limit: usize,
) -> Vec<String> {
    let mut selected: Vec<String> = if explicit.is_empty() {
        top_by_quote_volume(tickers, quote_asset, max_symbols)
    } else {
        let mut out: Vec<String> = Vec::new();
        for sym in explicit.iter().map(|s| s.to_uppercase()) {
            if !out.contains(&sym) {
                out.push(sym);
            }
        }
        out
    };

    for reference in references {
        if !selected.contains(reference) {
            selected.push(reference.clone());
        }
    }

    while selected.len() > stream_limit {
        match selected.iter().rposition(|s| !references.contains(s)) {
            Some(pos) => {
                selected.remove(pos);
            }
            None => selected.truncate(stream_limit),
        }
    }
    selected
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner {
    connector: Arc<StreamConnector>,
    buffers: Arc<BufferManager>,
    calculator: MetricsCalculator,
    rules: Vec<SignalRule>,
    events: broadcast::Sender<EngineEvent>,
    tickers: RwLock<HashMap<String, Ticker>>,
    ticker_snapshot: RwLock<Arc<Vec<Ticker>>>,
    /// Latest close per symbol, including in-progress candles.
    last_prices: RwLock<HashMap<String, f64>>,
    symbols: RwLock<Vec<String>>,
    fatal: watch::Sender<Option<String>>,
}

impl Inner {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Merge a ticker batch and refresh the sorted snapshot.
    fn apply_tickers(&self, batch: &[Ticker]) -> Arc<Vec<Ticker>> {
        let mut map = self.tickers.write();
        for ticker in batch {
            map.insert(ticker.symbol.clone(), ticker.clone());
        }
        let mut all: Vec<Ticker> = map.values().cloned().collect();
        drop(map);
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let snapshot = Arc::new(all);
        *self.ticker_snapshot.write() = snapshot.clone();
        snapshot
    }

    fn handle_kline(&self, update: KlineUpdate) {
        let KlineUpdate {
            symbol,
            interval,
            candle,
        } = update;
        if interval != BASE_INTERVAL {
            return;
        }
        self.last_prices.write().insert(symbol.clone(), candle.close);
        if candle.is_final {
            self.on_final_candle(&symbol, candle);
        }
    }

    fn handle(&self, event: ConnectorEvent) {
        match event {
            // Delivered through the kline feed.
            ConnectorEvent::Kline { .. } => {}
            ConnectorEvent::Ticker(batch) => {
                let tickers = self.apply_tickers(&batch);
                self.emit(EngineEvent::TickerUpdate { tickers });
            }
            ConnectorEvent::Connected => self.emit(EngineEvent::ConnectionChanged {
                state: ConnectionState::Connected,
            }),
            ConnectorEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "upstream reconnecting");
                self.emit(EngineEvent::ConnectionChanged {
                    state: ConnectionState::Reconnecting,
                });
            }
            ConnectorEvent::Closed { manual } => {
                debug!(manual, "upstream closed");
                self.emit(EngineEvent::ConnectionChanged {
                    state: ConnectionState::Disconnected,
                });
            }
            ConnectorEvent::Error(e) => warn!(error = %e, "upstream error"),
            ConnectorEvent::MaxReconnectReached { attempts } => {
                error!(attempts, "upstream reconnect budget exhausted -- restart required");
                self.emit(EngineEvent::ConnectionChanged {
                    state: ConnectionState::Disconnected,
                });
                let reason = format!("reconnect budget exhausted after {attempts} attempts");
                self.fatal.send_replace(Some(reason.clone()));
                self.emit(EngineEvent::Fatal { reason });
            }
        }
    }

    fn on_final_candle(&self, symbol: &str, candle: crate::market_data::Candle) {
        if !self.buffers.update_candle(symbol, candle) {
            return;
        }
        let Some(metrics) = self.calculator.get_all_changes(symbol) else {
            return;
        };

        let signals = SignalEngine::evaluate(&metrics, &self.rules);
        self.emit(EngineEvent::MetricsUpdate {
            symbol: symbol.to_string(),
            metrics,
            timestamp: now_ms(),
        });
        for signal in signals {
            info!(
                symbol = %signal.symbol,
                rule = %signal.rule_type,
                severity = %signal.severity,
                "signal fired"
            );
            self.emit(EngineEvent::Signal(signal));
        }
    }
}

// ---------------------------------------------------------------------------
// StreamOrchestrator
// ---------------------------------------------------------------------------

pub struct StreamOrchestrator {
    inner: Arc<Inner>,
    settings: OrchestratorSettings,
    /// Explicit symbol list used by the next `start`.
    explicit_symbols: RwLock<Vec<String>>,
    running: AtomicBool,
    backfill_cancel: Mutex<Option<Arc<AtomicBool>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    backfill: Mutex<Option<JoinHandle<()>>>,
}

impl StreamOrchestrator {
    pub fn new(
        connector: Arc<StreamConnector>,
        buffers: Arc<BufferManager>,
        calculator: MetricsCalculator,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                buffers,
                calculator,
                rules: settings.rules.clone(),
                events,
                tickers: RwLock::new(HashMap::new()),
                ticker_snapshot: RwLock::new(Arc::new(Vec::new())),
                last_prices: RwLock::new(HashMap::new()),
                symbols: RwLock::new(Vec::new()),
                fatal: watch::channel(None).0,
            }),
            explicit_symbols: RwLock::new(settings.symbols.clone()),
            settings,
            running: AtomicBool::new(false),
            backfill_cancel: Mutex::new(None),
            pump: Mutex::new(None),
            backfill: Mutex::new(None),
        }
    }

    /// Wire every component from configuration around `source`.
    pub fn from_config(config: &EngineConfig, source: Arc<dyn KlineSource>) -> Self {
        let connector = Arc::new(StreamConnector::new(config.connector_config()));
        let buffers = Arc::new(BufferManager::new(source));
        let calculator =
            MetricsCalculator::with_references(buffers.clone(), config.reference_symbols.clone());
        Self::new(connector, buffers, calculator, OrchestratorSettings::from(config))
    }

    /// Run the start-up sequence. Fails if the upstream cannot be reached or
    /// no ticker batch arrives within `ticker_wait`.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("orchestrator already running");
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "engine start failed");
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let inner = &self.inner;
        let connector = &inner.connector;
        inner.fatal.send_replace(None);

        // ── 1. Connect and wait for tickers ──────────────────────────────
        let mut upstream = connector.events();
        connector
            .connect()
            .await
            .context("failed to connect to market-data stream")?;
        inner.emit(EngineEvent::ConnectionChanged {
            state: ConnectionState::Connected,
        });
        connector.subscribe(&[TICKER_ARRAY_STREAM.to_string()])?;

        let first = tokio::time::timeout(self.settings.ticker_wait, async {
            loop {
                match upstream.recv().await {
                    Ok(ConnectorEvent::Ticker(batch)) => return Ok(batch),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("connector event channel closed")
                    }
                }
            }
        })
        .await
        .with_context(|| {
            format!(
                "no ticker data received within {}ms",
                self.settings.ticker_wait.as_millis()
            )
        })??;

        // ── 2. Tickers ready ─────────────────────────────────────────────
        let tickers = inner.apply_tickers(&first);
        info!(tickers = tickers.len(), "ticker snapshot ready");
        inner.emit(EngineEvent::TickersReady {
            count: tickers.len(),
        });

        // ── 3. Symbol selection ──────────────────────────────────────────
        let stream_limit = connector.config().max_streams.saturating_sub(1);
        let explicit = self.explicit_symbols.read().clone();
        let symbols = select_symbols(
            &explicit,
            &tickers,
            self.settings.quote_asset.as_deref(),
            self.settings.max_symbols,
            inner.calculator.reference_symbols(),
            stream_limit,
        );
        if symbols.is_empty() {
            bail!("no symbols selected");
        }
        inner.buffers.initialize(&symbols);
        *inner.symbols.write() = symbols.clone();
        info!(count = symbols.len(), "symbols selected");

        // ── 4. Background backfill ───────────────────────────────────────
        let cancel = Arc::new(AtomicBool::new(false));
        *self.backfill_cancel.lock() = Some(cancel.clone());
        let backfill_inner = inner.clone();
        let backfill_symbols = symbols.clone();
        let options = self.settings.backfill.clone();
        let handle = tokio::spawn(async move {
            let progress_inner = backfill_inner.clone();
            let report = backfill_inner
                .buffers
                .backfill_all(&backfill_symbols, &options, &cancel, move |completed, total| {
                    progress_inner.emit(EngineEvent::BackfillProgress { completed, total });
                })
                .await;
            backfill_inner.emit(EngineEvent::BackfillComplete(report));
        });
        *self.backfill.lock() = Some(handle);

        // ── 5. Kline subscriptions ───────────────────────────────────────
        let mut klines = connector.kline_feed(self.settings.event_capacity);
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| kline_stream(s, BASE_INTERVAL))
            .collect();
        connector.subscribe(&streams)?;

        // ── 6. Steady-state pump ─────────────────────────────────────────
        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = klines.recv() => match update {
                        Some(update) => pump_inner.handle_kline(update),
                        None => break,
                    },
                    event = upstream.recv() => match event {
                        Ok(event) => pump_inner.handle(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "engine lagging behind upstream status events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("event pump stopped");
        });
        *self.pump.lock() = Some(pump);

        info!(symbols = symbols.len(), streams = streams.len() + 1, "engine started");
        Ok(())
    }

    /// Tear everything down. Buffers are discarded; a later `start` rebuilds
    /// them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(cancel) = self.backfill_cancel.lock().take() {
            cancel.store(true, Ordering::Relaxed);
        }
        self.inner.connector.stop().await;

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.inner.connector.detach_kline_feed();
        self.inner.connector.clear_subscriptions();
        let backfill = self.backfill.lock().take();
        if let Some(mut backfill) = backfill {
            if tokio::time::timeout(Duration::from_secs(1), &mut backfill).await.is_err() {
                backfill.abort();
            }
        }

        self.inner.buffers.clear();
        self.inner.symbols.write().clear();
        self.inner.last_prices.write().clear();
        self.inner.emit(EngineEvent::ConnectionChanged {
            state: ConnectionState::Disconnected,
        });
        info!("engine stopped");
    }

    /// Replace the explicit symbol list used by the next `start`. An empty
    /// list falls back to quote-volume ranking.
    pub fn set_symbols(&self, symbols: Vec<String>) {
        *self.explicit_symbols.write() = symbols;
    }

    /// Resolve once the engine hits a fatal condition, with its reason.
    pub async fn wait_fatal(&self) -> String {
        let mut fatal = self.inner.fatal.subscribe();
        let reason = match fatal.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone().unwrap_or_default(),
            // The sender lives as long as `self`.
            Err(_) => std::future::pending().await,
        };
        reason
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self, symbol: &str) -> Option<PartialChangeMetrics> {
        self.inner.calculator.get_all_changes(symbol)
    }

    pub fn all_metrics(&self) -> HashMap<String, PartialChangeMetrics> {
        self.inner.calculator.get_all_symbols_changes()
    }

    pub fn dominance(&self, symbol: &str, timeframe: Timeframe) -> DominanceRatios {
        self.inner.calculator.dominance(symbol, timeframe)
    }

    pub fn tickers(&self) -> Arc<Vec<Ticker>> {
        self.inner.ticker_snapshot.read().clone()
    }

    /// Live price from the newest kline, falling back to the ticker.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.inner.last_prices.read().get(symbol) {
            return Some(*price);
        }
        self.inner.tickers.read().get(symbol).map(|t| t.last_price)
    }

    pub fn warmup_status(&self) -> WarmupStatus {
        self.inner.buffers.warmup_status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connector.state()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.symbols.read().clone()
    }

    pub fn rules(&self) -> &[SignalRule] {
        &self.inner.rules
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        if let Some(backfill) = self.backfill.get_mut().take() {
            backfill.abort();
        }
    }
}

impl std::fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("running", &self.is_running())
            .field("symbols", &self.inner.symbols.read().len())
            .field("connector", &self.inner.connector)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::buffer_manager::tests::{series, StaticSource};
    use crate::market_data::ticker::tests::ticker;
    use crate::signals::{Condition, Metric, Severity};
    use crate::stream::{ConnectorConfig, ReconnectPolicy};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const T0: i64 = 1_700_000_100_000;

    fn refs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn select_ranks_and_appends_references() {
        let tickers = vec![
            ticker("SOLUSDT", 900.0),
            ticker("ETHUSDT", 800.0),
            ticker("DOGEUSDT", 700.0),
            ticker("ETHBTC", 10_000.0),
            ticker("BTCUSDT", 100.0),
        ];
        let selected = select_symbols(&[], &tickers, Some("USDT"), 2, &refs(&["BTCUSDT", "ETHUSDT"]), 1023);
        assert_eq!(selected, refs(&["SOLUSDT", "ETHUSDT", "BTCUSDT"]));
    }

    #[test]
    fn select_prefers_explicit_list() {
        let tickers = vec![ticker("SOLUSDT", 900.0)];
        let explicit = refs(&["arbusdt", "ARBUSDT", "OPUSDT"]);
        let selected = select_symbols(&explicit, &tickers, Some("USDT"), 1, &refs(&["BTCUSDT"]), 1023);
        assert_eq!(selected, refs(&["ARBUSDT", "OPUSDT", "BTCUSDT"]));
    }

    #[test]
    fn select_respects_stream_limit_keeping_references() {
        let tickers: Vec<Ticker> = (0..10)
            .map(|i| ticker(&format!("C{i}USDT"), 1000.0 - i as f64))
            .collect();
        let selected = select_symbols(&[], &tickers, None, 10, &refs(&["BTCUSDT"]), 4);
        assert_eq!(selected, refs(&["C0USDT", "C1USDT", "C2USDT", "BTCUSDT"]));
    }

    fn tickers_frame() -> String {
        let item = |sym: &str, qv: f64| {
            serde_json::json!({
                "e": "24hrTicker", "E": T0, "s": sym, "P": "1.0", "o": "100", "h": "110",
                "l": "95", "c": "104", "v": "1000", "q": qv.to_string()
            })
        };
        serde_json::json!({
            "stream": "!ticker@arr",
            "data": [item("SOLUSDT", 9e6), item("ETHUSDT", 8e6), item("DOGEUSDT", 1e6), item("BTCUSDT", 7e6)]
        })
        .to_string()
    }

    fn kline_frame(symbol: &str, open_time: i64, close: f64, is_final: bool) -> String {
        serde_json::json!({
            "stream": format!("{}@kline_5m", symbol.to_lowercase()),
            "data": {
                "e": "kline", "s": symbol,
                "k": {
                    "t": open_time, "T": open_time + 299_999, "i": "5m",
                    "o": close.to_string(), "h": close.to_string(), "l": close.to_string(),
                    "c": close.to_string(), "v": "10", "q": (close * 10.0).to_string(), "x": is_final
                }
            }
        })
        .to_string()
    }

    fn settings(ticker_wait: Duration) -> OrchestratorSettings {
        OrchestratorSettings {
            symbols: Vec::new(),
            max_symbols: 2,
            quote_asset: Some("USDT".to_string()),
            ticker_wait,
            backfill: BackfillOptions {
                batch_size: 2,
                batch_delay: Duration::from_millis(1),
                limit: 289,
            },
            rules: vec![SignalRule {
                id: "jump".to_string(),
                rule_type: "momentum_burst_long".to_string(),
                conditions: vec![Condition::Above {
                    metric: Metric::ChangePercent(Timeframe::M15),
                    threshold: 1.0,
                }],
                severity: Severity::High,
                enabled: true,
                enabled_symbols: Vec::new(),
                value_metric: Metric::ChangePercent(Timeframe::M15),
            }],
            event_capacity: 1024,
        }
    }

    fn connector(url: String, event_capacity: usize) -> Arc<StreamConnector> {
        Arc::new(StreamConnector::new(ConnectorConfig {
            url,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                max_attempts: Some(1),
            },
            subscribe_chunk_size: 100,
            subscribe_chunk_delay: Duration::ZERO,
            max_streams: 1024,
            event_capacity,
        }))
    }

    fn orchestrator(url: String, source: StaticSource, ticker_wait: Duration) -> StreamOrchestrator {
        let connector = connector(url, 1024);
        let buffers = Arc::new(BufferManager::new(Arc::new(source)));
        let calculator = MetricsCalculator::with_references(buffers.clone(), refs(&["BTCUSDT"]));
        StreamOrchestrator::new(connector, buffers, calculator, settings(ticker_wait))
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("engine events closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    #[tokio::test]
    async fn full_pipeline_emits_metrics_and_signals() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (live_tx, mut live_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) if text.contains("!ticker@arr") => {
                            ws.send(Message::Text(tickers_frame())).await.unwrap();
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    frame = live_rx.recv() => match frame {
                        Some(frame) => ws.send(Message::Text(frame)).await.unwrap(),
                        None => break,
                    },
                }
            }
        });

        let mut source = StaticSource::default();
        source.history.insert("SOLUSDT".to_string(), series(T0, &[100.0; 11]));
        source.history.insert("ETHUSDT".to_string(), series(T0, &[50.0; 11]));
        source.failing.insert("BTCUSDT".to_string());

        let engine = orchestrator(url, source, Duration::from_secs(5));
        let mut events = engine.subscribe();
        engine.start().await.unwrap();

        let ready = next_matching(&mut events, |e| matches!(e, EngineEvent::TickersReady { .. })).await;
        assert!(matches!(ready, EngineEvent::TickersReady { count: 4 }));
        assert_eq!(engine.symbols(), refs(&["SOLUSDT", "ETHUSDT", "BTCUSDT"]));
        assert_eq!(engine.tickers().len(), 4);
        assert_eq!(engine.last_price("DOGEUSDT"), Some(104.0));

        let done = next_matching(&mut events, |e| matches!(e, EngineEvent::BackfillComplete(_))).await;
        match done {
            EngineEvent::BackfillComplete(report) => {
                assert_eq!(report.successful.len(), 2);
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].symbol, "BTCUSDT");
            }
            _ => unreachable!(),
        }
        assert!(engine.metrics("SOLUSDT").unwrap().h1.is_none());

        // An in-progress candle only moves the live price.
        live_tx.send(kline_frame("SOLUSDT", T0 + 11 * 300_000, 104.0, false)).unwrap();
        live_tx.send(kline_frame("SOLUSDT", T0 + 11 * 300_000, 105.0, true)).unwrap();

        let update = next_matching(&mut events, |e| matches!(e, EngineEvent::MetricsUpdate { .. })).await;
        match update {
            EngineEvent::MetricsUpdate { symbol, metrics, .. } => {
                assert_eq!(symbol, "SOLUSDT");
                assert_eq!(metrics.candle_count, 12);
                assert!((metrics.m15.unwrap().price_change_percent - 5.0).abs() < 1e-9);
                assert!(metrics.h1.is_some());
            }
            _ => unreachable!(),
        }

        let fired = next_matching(&mut events, |e| matches!(e, EngineEvent::Signal(_))).await;
        match fired {
            EngineEvent::Signal(signal) => {
                assert_eq!(signal.symbol, "SOLUSDT");
                assert_eq!(signal.rule_type, "momentum_burst_long");
                assert_eq!(signal.timestamp, T0 + 12 * 300_000 - 1);
            }
            _ => unreachable!(),
        }
        assert_eq!(engine.last_price("SOLUSDT"), Some(105.0));

        let status = engine.warmup_status();
        assert_eq!(status.total_symbols, 3);
        assert_eq!(status.ready[&Timeframe::H1], 1);

        engine.stop().await;
        assert!(!engine.is_running());
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
        assert!(engine.symbols().is_empty());
        assert!(engine.all_metrics().is_empty());
    }

    /// Serve tickers on the ticker subscription and hand every other text
    /// frame to `on_frame`, whose replies are sent back.
    async fn ticker_server<F>(listener: TcpListener, on_frame: F)
    where
        F: Fn(&str) -> Vec<String> + Clone + Send + 'static,
    {
        while let Ok((stream, _)) = listener.accept().await {
            let on_frame = on_frame.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let replies = if text.contains("!ticker@arr") {
                        vec![tickers_frame()]
                    } else {
                        on_frame(&text)
                    };
                    for reply in replies {
                        if ws.send(Message::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn kline_burst_survives_small_event_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(ticker_server(listener, |frame: &str| {
            if frame.contains("solusdt@kline_5m") {
                (0..200)
                    .map(|i| kline_frame("SOLUSDT", T0 + i * 300_000, 100.0 + i as f64, true))
                    .collect()
            } else {
                Vec::new()
            }
        }));

        let mut engine_settings = settings(Duration::from_secs(5));
        engine_settings.symbols = refs(&["SOLUSDT"]);
        engine_settings.event_capacity = 16;
        let buffers = Arc::new(BufferManager::new(Arc::new(StaticSource::default())));
        let calculator = MetricsCalculator::with_references(buffers.clone(), refs(&["BTCUSDT"]));
        let engine = StreamOrchestrator::new(connector(url, 16), buffers, calculator, engine_settings);
        engine.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while engine.metrics("SOLUSDT").map(|m| m.candle_count) != Some(200) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("final candles were lost");

        let open_times = engine
            .inner
            .buffers
            .with_buffer("SOLUSDT", |b| b.iter().map(|c| c.open_time).collect::<Vec<_>>())
            .unwrap();
        let expected: Vec<i64> = (0..200).map(|i| T0 + i * 300_000).collect();
        assert_eq!(open_times, expected);
        assert_eq!(engine.last_price("SOLUSDT"), Some(299.0));

        engine.stop().await;
    }

    #[tokio::test]
    async fn restart_replaces_tracked_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(ticker_server(listener, |_: &str| Vec::new()));

        let engine = orchestrator(url, StaticSource::default(), Duration::from_secs(5));
        engine.set_symbols(refs(&["SOLUSDT"]));
        engine.start().await.unwrap();
        assert_eq!(
            engine.inner.connector.subscriptions(),
            refs(&["!ticker@arr", "solusdt@kline_5m", "btcusdt@kline_5m"])
        );

        engine.stop().await;
        assert!(engine.inner.connector.subscriptions().is_empty());

        engine.set_symbols(refs(&["ETHUSDT"]));
        engine.start().await.unwrap();
        assert_eq!(
            engine.inner.connector.subscriptions(),
            refs(&["!ticker@arr", "ethusdt@kline_5m", "btcusdt@kline_5m"])
        );
        assert_eq!(engine.symbols(), refs(&["ETHUSDT", "BTCUSDT"]));

        engine.stop().await;
    }

    #[tokio::test]
    async fn wait_fatal_resolves_when_reconnects_run_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Every reconnect attempt is refused from here on.
            drop(listener);
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if text.contains("!ticker@arr") {
                        ws.send(Message::Text(tickers_frame())).await.unwrap();
                    } else if text.contains("@kline_5m") {
                        break;
                    }
                }
            }
        });

        let engine = orchestrator(url, StaticSource::default(), Duration::from_secs(5));
        let mut events = engine.subscribe();
        engine.start().await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), engine.wait_fatal())
            .await
            .expect("fatal condition not reported");
        assert!(reason.contains("reconnect budget exhausted"));

        let fatal = next_matching(&mut events, |e| matches!(e, EngineEvent::Fatal { .. })).await;
        assert!(matches!(fatal, EngineEvent::Fatal { .. }));

        engine.stop().await;
    }

    #[tokio::test]
    async fn start_fails_without_tickers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let engine = orchestrator(url, StaticSource::default(), Duration::from_millis(100));
        let err = engine.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("no ticker data"));
        assert!(!engine.is_running());
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn start_fails_when_upstream_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let engine = orchestrator(url, StaticSource::default(), Duration::from_millis(100));
        assert!(engine.start().await.is_err());
        assert!(!engine.is_running());
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let event = EngineEvent::BackfillProgress {
            completed: 3,
            total: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "backfill_progress");
        assert_eq!(json["completed"], 3);
    }
}
