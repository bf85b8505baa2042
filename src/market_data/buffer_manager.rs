// =============================================================================
// Buffer Manager — per-symbol candle rings, backfill and warm-up tracking
// =============================================================================
//
// All buffers live behind one parking_lot::RwLock. The ingestion path is the
// only writer; metrics reads take the read guard for the whole per-symbol
// computation so a snapshot never observes a half-applied push.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::candle_buffer::{Candle, CandleBuffer, CANDLE_CAPACITY};
use super::timeframe::{Timeframe, BASE_INTERVAL};

// ---------------------------------------------------------------------------
// Historical source seam
// ---------------------------------------------------------------------------

/// Anything able to serve historical candles for backfill.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch up to `limit` of the most recent candles, oldest first.
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;
}

// ---------------------------------------------------------------------------
// Backfill types
// ---------------------------------------------------------------------------

/// Tuning for [`BufferManager::backfill_all`].
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Symbols fetched concurrently per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Candles requested per symbol. One more than capacity so the still-open
    /// candle the exchange returns last does not cost a slot.
    pub limit: u32,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(1000),
            limit: CANDLE_CAPACITY as u32 + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillFailure {
    pub symbol: String,
    pub error: String,
}

/// Outcome of a backfill run. Failures are collected, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub successful: Vec<String>,
    pub failed: Vec<BackfillFailure>,
    /// True when the run stopped early because the cancel flag was raised.
    pub cancelled: bool,
}

/// Global readiness counters across all tracked symbols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupStatus {
    pub total_symbols: usize,
    /// Number of symbols holding enough candles for each timeframe.
    pub ready: BTreeMap<Timeframe, usize>,
    /// Mean buffer fill ratio as a percentage.
    pub overall_progress: f64,
}

// ---------------------------------------------------------------------------
// BufferManager
// ---------------------------------------------------------------------------

pub struct BufferManager {
    buffers: RwLock<HashMap<String, CandleBuffer>>,
    source: Arc<dyn KlineSource>,
    capacity: usize,
}

impl BufferManager {
    pub fn new(source: Arc<dyn KlineSource>) -> Self {
        Self::with_capacity(source, CANDLE_CAPACITY)
    }

    pub fn with_capacity(source: Arc<dyn KlineSource>, capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            source,
            capacity,
        }
    }

    /// Register one empty buffer per symbol. Already registered symbols keep
    /// their data.
    pub fn initialize(&self, symbols: &[String]) {
        let mut map = self.buffers.write();
        for symbol in symbols {
            map.entry(symbol.clone())
                .or_insert_with(|| CandleBuffer::new(self.capacity));
        }
        info!(symbols = map.len(), capacity = self.capacity, "candle buffers initialised");
    }

    /// Drop every buffer.
    pub fn clear(&self) {
        self.buffers.write().clear();
    }

    /// Registered symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.buffers.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.buffers.read().contains_key(symbol)
    }

    /// Run `f` against the symbol's buffer under the read guard.
    pub fn with_buffer<R>(&self, symbol: &str, f: impl FnOnce(&CandleBuffer) -> R) -> Option<R> {
        self.buffers.read().get(symbol).map(f)
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Push a finalized live candle. Returns `true` when the candle was
    /// admitted.
    ///
    /// Unregistered symbols are ignored. Candles whose `open_time` is not newer
    /// than the newest buffered candle are dropped as duplicate or
    /// out-of-order deliveries.
    pub fn update_candle(&self, symbol: &str, candle: Candle) -> bool {
        if !candle.is_final {
            return false;
        }

        let mut map = self.buffers.write();
        let Some(buffer) = map.get_mut(symbol) else {
            return false;
        };

        if let Some(newest) = buffer.newest() {
            if candle.open_time <= newest.open_time {
                debug!(
                    symbol,
                    open_time = candle.open_time,
                    newest_open_time = newest.open_time,
                    "dropping duplicate or out-of-order candle"
                );
                return false;
            }
        }

        buffer.push(candle);
        true
    }

    /// Replace a symbol's history with `candles` (non-final ones discarded),
    /// keeping any live candles newer than the last fetched one. Returns the
    /// resulting buffer length, or `None` for an unregistered symbol.
    pub fn apply_backfill(&self, symbol: &str, candles: Vec<Candle>) -> Option<usize> {
        let mut history: Vec<Candle> = candles.into_iter().filter(|c| c.is_final).collect();
        history.sort_by_key(|c| c.open_time);
        history.dedup_by_key(|c| c.open_time);

        let mut map = self.buffers.write();
        let buffer = map.get_mut(symbol)?;

        let last_fetched = history.last().map(|c| c.open_time);
        let live: Vec<Candle> = buffer
            .iter()
            .filter(|c| last_fetched.map_or(true, |t| c.open_time > t))
            .cloned()
            .collect();

        let mut rebuilt = CandleBuffer::new(self.capacity);
        for candle in history.into_iter().chain(live) {
            rebuilt.push(candle);
        }
        let len = rebuilt.len();
        *buffer = rebuilt;
        Some(len)
    }

    /// Fetch history for every symbol in batches of `options.batch_size`,
    /// sleeping `options.batch_delay` between batches.
    ///
    /// Individual failures are recorded in the report and the run continues.
    /// `cancel` is checked between batches, never mid-batch.
    /// `on_progress(completed, total)` fires after every batch.
    pub async fn backfill_all<F>(
        &self,
        symbols: &[String],
        options: &BackfillOptions,
        cancel: &AtomicBool,
        mut on_progress: F,
    ) -> BackfillReport
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = symbols.len();
        let batch_size = options.batch_size.max(1);
        let mut report = BackfillReport::default();
        let mut completed = 0usize;

        info!(total, batch_size, delay_ms = options.batch_delay.as_millis() as u64, "backfill starting");

        for (index, batch) in symbols.chunks(batch_size).enumerate() {
            if index > 0 && !options.batch_delay.is_zero() {
                tokio::time::sleep(options.batch_delay).await;
            }
            if cancel.load(Ordering::Relaxed) {
                info!(completed, total, "backfill cancelled");
                report.cancelled = true;
                break;
            }

            let source = &self.source;
            let fetches = batch.iter().map(|symbol| async move {
                let result = source.fetch_klines(symbol, BASE_INTERVAL, options.limit).await;
                (symbol, result)
            });

            for (symbol, result) in join_all(fetches).await {
                match result {
                    Ok(candles) => match self.apply_backfill(symbol, candles) {
                        Some(len) => {
                            debug!(symbol = %symbol, candles = len, "backfill applied");
                            report.successful.push(symbol.clone());
                        }
                        None => {
                            warn!(symbol = %symbol, "backfill fetched for unregistered symbol");
                            report.failed.push(BackfillFailure {
                                symbol: symbol.clone(),
                                error: "symbol not registered".to_string(),
                            });
                        }
                    },
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "backfill failed -- symbol will warm up from live data");
                        report.failed.push(BackfillFailure {
                            symbol: symbol.clone(),
                            error: format!("{e:#}"),
                        });
                    }
                }
                completed += 1;
            }

            on_progress(completed, total);
        }

        info!(
            successful = report.successful.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "backfill finished"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Warm-up tracking
    // -------------------------------------------------------------------------

    /// Buffer fill ratio in `0.0..=1.0`; `0.0` for unknown symbols.
    pub fn warmup_progress(&self, symbol: &str) -> f64 {
        self.with_buffer(symbol, CandleBuffer::fill_ratio)
            .unwrap_or(0.0)
    }

    pub fn is_ready(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.with_buffer(symbol, |b| b.has_enough_data(timeframe.candle_count()))
            .unwrap_or(false)
    }

    /// Symbols with enough candles for `timeframe`, sorted.
    pub fn ready_symbols(&self, timeframe: Timeframe) -> Vec<String> {
        let mut ready: Vec<String> = self
            .buffers
            .read()
            .iter()
            .filter(|(_, b)| b.has_enough_data(timeframe.candle_count()))
            .map(|(s, _)| s.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn warmup_status(&self) -> WarmupStatus {
        let map = self.buffers.read();
        let total_symbols = map.len();

        let ready = Timeframe::ALL
            .iter()
            .map(|tf| {
                let count = map
                    .values()
                    .filter(|b| b.has_enough_data(tf.candle_count()))
                    .count();
                (*tf, count)
            })
            .collect();

        let overall_progress = if total_symbols == 0 {
            0.0
        } else {
            map.values().map(CandleBuffer::fill_ratio).sum::<f64>() / total_symbols as f64 * 100.0
        };

        WarmupStatus {
            total_symbols,
            ready,
            overall_progress,
        }
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("symbols", &self.buffers.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
