// =============================================================================
// Metrics Calculator — windowed price change and volume per timeframe
// =============================================================================
//
// Every window is re-summed from the last N candles on each query (O(N)).
// Timeframes without enough history come back as `None`, never as zero, so
// consumers can tell "still warming up" apart from "flat".
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::buffer_manager::BufferManager;
use super::candle_buffer::CandleBuffer;
use super::timeframe::Timeframe;

/// Reference instruments used for dominance ratios.
pub const DEFAULT_REFERENCE_SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "PAXGUSDT"];

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Aggregate over one trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub price_change: f64,
    pub price_change_percent: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    /// Open time of the first candle in the window.
    pub window_start: i64,
    /// Close time of the last candle in the window.
    pub window_end: i64,
    pub candle_count: usize,
}

/// Snapshot of every timeframe for one symbol. A `None` field means the buffer
/// is still warming up for that window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialChangeMetrics {
    pub symbol: String,
    /// Close of the newest finalized candle.
    pub last_price: Option<f64>,
    /// Close time of the newest finalized candle (ms), 0 when empty.
    pub timestamp: i64,
    /// Candles currently buffered.
    pub candle_count: usize,
    #[serde(rename = "5m")]
    pub m5: Option<WindowMetrics>,
    #[serde(rename = "15m")]
    pub m15: Option<WindowMetrics>,
    #[serde(rename = "1h")]
    pub h1: Option<WindowMetrics>,
    #[serde(rename = "4h")]
    pub h4: Option<WindowMetrics>,
    #[serde(rename = "8h")]
    pub h8: Option<WindowMetrics>,
    #[serde(rename = "12h")]
    pub h12: Option<WindowMetrics>,
    #[serde(rename = "1d")]
    pub d1: Option<WindowMetrics>,
}

impl PartialChangeMetrics {
    /// Build a snapshot from a buffer in one pass under the caller's guard.
    pub fn from_buffer(symbol: &str, buffer: &CandleBuffer) -> Self {
        let newest = buffer.newest();
        Self {
            symbol: symbol.to_string(),
            last_price: newest.map(|c| c.close),
            timestamp: newest.map_or(0, |c| c.close_time),
            candle_count: buffer.len(),
            m5: window(buffer, Timeframe::M5),
            m15: window(buffer, Timeframe::M15),
            h1: window(buffer, Timeframe::H1),
            h4: window(buffer, Timeframe::H4),
            h8: window(buffer, Timeframe::H8),
            h12: window(buffer, Timeframe::H12),
            d1: window(buffer, Timeframe::D1),
        }
    }

    pub fn get(&self, timeframe: Timeframe) -> Option<&WindowMetrics> {
        match timeframe {
            Timeframe::M5 => self.m5.as_ref(),
            Timeframe::M15 => self.m15.as_ref(),
            Timeframe::H1 => self.h1.as_ref(),
            Timeframe::H4 => self.h4.as_ref(),
            Timeframe::H8 => self.h8.as_ref(),
            Timeframe::H12 => self.h12.as_ref(),
            Timeframe::D1 => self.d1.as_ref(),
        }
    }

    /// Percent change for `timeframe`, if warmed up.
    pub fn change_percent(&self, timeframe: Timeframe) -> Option<f64> {
        self.get(timeframe).map(|w| w.price_change_percent)
    }

    /// Timeframes that already have a value.
    pub fn available(&self) -> Vec<Timeframe> {
        Timeframe::ALL
            .into_iter()
            .filter(|tf| self.get(*tf).is_some())
            .collect()
    }
}

/// A symbol's change expressed against each reference instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominanceRatios {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// `(reference symbol, relative change %)`, `None` while either side is
    /// warming up.
    pub ratios: Vec<(String, Option<f64>)>,
}

// ---------------------------------------------------------------------------
// Window math
// ---------------------------------------------------------------------------

/// Aggregate the last `timeframe.candle_count()` candles, or `None` if the
/// buffer holds fewer.
pub fn window(buffer: &CandleBuffer, timeframe: Timeframe) -> Option<WindowMetrics> {
    let n = timeframe.candle_count();
    if !buffer.has_enough_data(n) {
        return None;
    }

    let mut candles = buffer.iter_last(n);
    let first = candles.next()?;

    let start_close = first.close;
    let window_start = first.open_time;
    let mut end_close = first.close;
    let mut window_end = first.close_time;
    let mut base_volume = first.volume;
    let mut quote_volume = first.quote_volume;

    for c in candles {
        end_close = c.close;
        window_end = c.close_time;
        base_volume += c.volume;
        quote_volume += c.quote_volume;
    }

    let price_change = end_close - start_close;
    // A zero starting close is defined as zero change.
    let price_change_percent = if start_close == 0.0 {
        0.0
    } else {
        price_change / start_close * 100.0
    };

    Some(WindowMetrics {
        price_change,
        price_change_percent,
        base_volume,
        quote_volume,
        window_start,
        window_end,
        candle_count: n,
    })
}

/// Change of `change_pct` measured in units of an instrument that moved
/// `reference_pct` over the same window.
pub fn relative_change(change_pct: f64, reference_pct: f64) -> Option<f64> {
    let reference_factor = 1.0 + reference_pct / 100.0;
    if reference_factor == 0.0 {
        return None;
    }
    let ratio = ((1.0 + change_pct / 100.0) / reference_factor - 1.0) * 100.0;
    ratio.is_finite().then_some(ratio)
}

// ---------------------------------------------------------------------------
// MetricsCalculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    buffers: Arc<BufferManager>,
    reference_symbols: Vec<String>,
}

impl MetricsCalculator {
    pub fn new(buffers: Arc<BufferManager>) -> Self {
        Self::with_references(
            buffers,
            DEFAULT_REFERENCE_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_references(buffers: Arc<BufferManager>, reference_symbols: Vec<String>) -> Self {
        Self {
            buffers,
            reference_symbols,
        }
    }

    pub fn reference_symbols(&self) -> &[String] {
        &self.reference_symbols
    }

    pub fn get_change(&self, symbol: &str, timeframe: Timeframe) -> Option<WindowMetrics> {
        self.buffers
            .with_buffer(symbol, |buffer| window(buffer, timeframe))
            .flatten()
    }

    /// Every timeframe for `symbol`; `None` only for an unregistered symbol.
    pub fn get_all_changes(&self, symbol: &str) -> Option<PartialChangeMetrics> {
        self.buffers
            .with_buffer(symbol, |buffer| PartialChangeMetrics::from_buffer(symbol, buffer))
    }

    pub fn get_all_symbols_changes(&self) -> HashMap<String, PartialChangeMetrics> {
        self.buffers
            .symbols()
            .into_iter()
            .filter_map(|symbol| {
                let metrics = self.get_all_changes(&symbol)?;
                Some((symbol, metrics))
            })
            .collect()
    }

    /// `symbol`'s change over `timeframe` relative to each reference
    /// instrument.
    pub fn dominance(&self, symbol: &str, timeframe: Timeframe) -> DominanceRatios {
        let own = self.get_change(symbol, timeframe).map(|w| w.price_change_percent);
        let ratios = self
            .reference_symbols
            .iter()
            .map(|reference| {
                let reference_pct = self
                    .get_change(reference, timeframe)
                    .map(|w| w.price_change_percent);
                let ratio = match (own, reference_pct) {
                    (Some(c), Some(r)) => relative_change(c, r),
                    _ => None,
                };
                (reference.clone(), ratio)
            })
            .collect();

        DominanceRatios {
            symbol: symbol.to_string(),
            timeframe,
            ratios,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
