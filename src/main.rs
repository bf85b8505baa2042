// =============================================================================
// Market Pulse — Main Entry Point
// =============================================================================
//
// Connects to the Binance combined stream, backfills the selected symbols,
// and logs metrics, signals and connection changes until Ctrl+C. A fatal
// engine error stops the process with a non-zero exit code.
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use market_pulse::binance::BinanceClient;
use market_pulse::runtime_config::{EngineConfig, CONFIG_FILE};
use market_pulse::{EngineEvent, StreamOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Market Pulse — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = match EngineConfig::load(CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let config = EngineConfig::default();
            if let Err(e) = config.save(CONFIG_FILE) {
                warn!(error = %e, "Failed to write default config");
            }
            config
        }
    };
    config.apply_env_overrides();

    if config.symbols.is_empty() {
        info!(max_symbols = config.max_symbols, quote = %config.quote_asset, "Symbols will be ranked by 24h quote volume");
    } else {
        info!(symbols = ?config.symbols, "Configured symbols");
    }

    // ── 2. REST client for backfill ──────────────────────────────────────
    let client = Arc::new(BinanceClient::new(&config.rest_url, config.rest_timeout())?);

    // Binance resets used weight every minute; mirror it locally so a blocked
    // backfill recovers.
    let rate_limit = client.rate_limit().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = rate_limit.snapshot();
            debug!(
                used_weight_1m = snapshot.used_weight_1m,
                blocked_requests = snapshot.blocked_requests,
                "resetting 1m rate-limit weight"
            );
            rate_limit.reset_1m_weight();
        }
    });

    // ── 3. Engine ────────────────────────────────────────────────────────
    let engine = Arc::new(StreamOrchestrator::from_config(&config, client));
    let mut events = engine.subscribe();

    engine.start().await?;
    info!(symbols = engine.symbols().len(), "Engine running. Press Ctrl+C to stop.");

    // ── 4. Event log ─────────────────────────────────────────────────────
    let log_engine = engine.clone();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&log_engine, event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── 5. Shutdown on Ctrl+C or a fatal engine error ────────────────────
    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!("Shutdown signal received — stopping gracefully");
            None
        }
        reason = engine.wait_fatal() => Some(reason),
    };

    engine.stop().await;
    logger.abort();

    if let Some(reason) = fatal {
        anyhow::bail!("engine stopped after fatal error: {reason}");
    }
    info!("Market Pulse shut down complete.");
    Ok(())
}

fn log_event(engine: &StreamOrchestrator, event: EngineEvent) {
    match event {
        EngineEvent::TickersReady { count } => info!(count, "Tickers ready"),
        EngineEvent::TickerUpdate { tickers } => debug!(count = tickers.len(), "Ticker update"),
        EngineEvent::BackfillProgress { completed, total } => {
            info!(completed, total, "Backfill progress");
        }
        EngineEvent::BackfillComplete(report) => {
            let status = engine.warmup_status();
            info!(
                successful = report.successful.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled,
                warmup_pct = status.overall_progress,
                "Backfill complete"
            );
            for failure in &report.failed {
                warn!(symbol = %failure.symbol, error = %failure.error, "Backfill failed for symbol");
            }
        }
        EngineEvent::MetricsUpdate { symbol, metrics, .. } => {
            debug!(
                symbol = %symbol,
                last_price = ?metrics.last_price,
                change_1h = ?metrics.h1.as_ref().map(|w| w.price_change_percent),
                change_1d = ?metrics.d1.as_ref().map(|w| w.price_change_percent),
                "Metrics update"
            );
        }
        EngineEvent::Signal(signal) => info!(
            id = %signal.id,
            symbol = %signal.symbol,
            rule = %signal.rule_type,
            severity = %signal.severity,
            value = ?signal.value,
            "Signal"
        ),
        EngineEvent::ConnectionChanged { state } => info!(state = %state, "Connection state changed"),
        EngineEvent::Fatal { reason } => error!(reason = %reason, "Engine fatal error — restart required"),
    }
}
