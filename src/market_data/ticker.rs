// =============================================================================
// Live ticker snapshots from the aggregate `!ticker@arr` stream
// =============================================================================

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Rolling 24h quote for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    /// 24h base-asset volume.
    pub base_volume: f64,
    /// 24h quote-asset notional.
    pub quote_volume: f64,
    pub price_change_percent: f64,
    pub event_time: i64,
}

/// Pick the `limit` symbols with the highest 24h quote volume, optionally
/// restricted to pairs quoted in `quote_asset`. Ties keep symbol order so the
/// selection is stable between runs.
pub fn top_by_quote_volume<'a, I>(tickers: I, quote_asset: Option<&str>, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a Ticker>,
{
    let mut ranked: Vec<&Ticker> = tickers
        .into_iter()
        .filter(|t| match quote_asset {
            Some(quote) => t.symbol.len() > quote.len() && t.symbol.ends_with(quote),
            None => true,
        })
        .filter(|t| t.quote_volume.is_finite())
        .collect();

    ranked.sort_by(|a, b| {
        b.quote_volume
            .partial_cmp(&a.quote_volume)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|t| t.symbol.clone())
        .collect()
}
