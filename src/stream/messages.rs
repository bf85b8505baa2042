// =============================================================================
// Wire messages for the Binance combined-stream websocket
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::warn;

use crate::binance::client::parse_str_f64;
use crate::market_data::{Candle, Ticker};

/// Stream name of the aggregate all-market ticker array.
pub const TICKER_ARRAY_STREAM: &str = "!ticker@arr";

/// Stream name of a symbol's candle updates.
pub fn kline_stream(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{interval}", symbol.to_lowercase())
}

/// One decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Kline {
        symbol: String,
        interval: String,
        candle: Candle,
    },
    Tickers(Vec<Ticker>),
    /// Reply to a SUBSCRIBE / UNSUBSCRIBE request.
    Ack { id: u64, error: Option<String> },
    Other,
}

/// Decode a text frame. Both the combined envelope
/// (`{"stream": .., "data": ..}`) and raw single-stream payloads are accepted.
pub fn parse_stream_message(text: &str) -> Result<StreamMessage> {
    let root: Value = serde_json::from_str(text).context("failed to parse stream JSON")?;

    if let Some(id) = root.get("id").and_then(Value::as_u64) {
        let error = root.get("error").map(|e| e.to_string());
        return Ok(StreamMessage::Ack { id, error });
    }

    let data = root.get("data").unwrap_or(&root);

    if let Some(items) = data.as_array() {
        let tickers = items
            .iter()
            .filter(|item| item["e"].as_str() == Some("24hrTicker"))
            .filter_map(|item| match parse_ticker(item) {
                Ok(ticker) => Some(ticker),
                Err(e) => {
                    warn!(symbol = ?item["s"].as_str(), error = %e, "skipping malformed ticker");
                    None
                }
            })
            .collect();
        return Ok(StreamMessage::Tickers(tickers));
    }

    match data["e"].as_str() {
        Some("kline") => parse_kline(data),
        Some("24hrTicker") => Ok(StreamMessage::Tickers(vec![parse_ticker(data)?])),
        _ => Ok(StreamMessage::Other),
    }
}

/// Expected shape:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": .., "T": .., "i": "5m", "o": "..", .., "x": false } }
/// ```
fn parse_kline(data: &Value) -> Result<StreamMessage> {
    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"]
        .as_str()
        .context("missing field k.i")?
        .to_string();

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: field_f64(&k["o"], "k.o")?,
        high: field_f64(&k["h"], "k.h")?,
        low: field_f64(&k["l"], "k.l")?,
        close: field_f64(&k["c"], "k.c")?,
        volume: field_f64(&k["v"], "k.v")?,
        quote_volume: field_f64(&k["q"], "k.q")?,
        is_final: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok(StreamMessage::Kline {
        symbol,
        interval,
        candle,
    })
}

fn parse_ticker(item: &Value) -> Result<Ticker> {
    Ok(Ticker {
        symbol: item["s"]
            .as_str()
            .context("missing field s")?
            .to_uppercase(),
        last_price: field_f64(&item["c"], "c")?,
        open_price: field_f64(&item["o"], "o")?,
        high_price: field_f64(&item["h"], "h")?,
        low_price: field_f64(&item["l"], "l")?,
        base_volume: field_f64(&item["v"], "v")?,
        quote_volume: field_f64(&item["q"], "q")?,
        price_change_percent: field_f64(&item["P"], "P")?,
        event_time: item["E"].as_i64().unwrap_or(0),
    })
}

/// Binance sends numeric values as JSON strings inside stream payloads.
fn field_f64(val: &Value, name: &str) -> Result<f64> {
    parse_str_f64(val).with_context(|| format!("invalid field {name}"))
}

/// Build chunked control frames (`SUBSCRIBE` / `UNSUBSCRIBE`), at most
/// `chunk_size` streams each. Request ids are drawn from `next_id`.
pub fn control_frames(
    method: &str,
    streams: &[String],
    chunk_size: usize,
    next_id: &AtomicU64,
) -> Vec<String> {
    streams
        .chunks(chunk_size.max(1))
        .map(|chunk| {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            json!({ "method": method, "params": chunk, "id": id }).to_string()
        })
        .collect()
}
