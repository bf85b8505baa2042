use serde::{Deserialize, Serialize};

use crate::error::BufferError;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Capacity of every per-symbol buffer: 24h of 5-minute candles.
pub const CANDLE_CAPACITY: usize = 288;

/// A single OHLCV candle from the Binance kline stream or REST backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base-asset quantity.
    pub volume: f64,
    /// Quote-asset notional.
    pub quote_volume: f64,
    pub is_final: bool,
}

// ---------------------------------------------------------------------------
// CandleBuffer -- fixed-capacity ring per symbol
// ---------------------------------------------------------------------------

/// Fixed-capacity ring buffer of finalized candles for one symbol.
///
/// `head` is the slot the next push writes to. Once `count == capacity` each
/// push overwrites the oldest candle and hands it back to the caller.
#[derive(Debug, Clone)]
pub struct CandleBuffer {
    slots: Vec<Option<Candle>>,
    head: usize,
    count: usize,
}

impl CandleBuffer {
    /// Create an empty buffer holding at most `capacity` candles.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            count: 0,
        }
    }

    /// Write `candle` at head. Returns the evicted candle when the buffer was
    /// already full.
    pub fn push(&mut self, candle: Candle) -> Option<Candle> {
        let capacity = self.capacity();
        let evicted = self.slots[self.head].replace(candle);
        self.head = (self.head + 1) % capacity;
        if self.count < capacity {
            self.count += 1;
            None
        } else {
            evicted
        }
    }

    /// The most recent `n` candles, oldest first.
    pub fn get_last_n(&self, n: usize) -> Result<Vec<Candle>, BufferError> {
        if n > self.count {
            return Err(BufferError::InsufficientData {
                requested: n,
                available: self.count,
            });
        }
        Ok(self.iter_last(n).cloned().collect())
    }

    /// Borrowing iterator over the most recent `n` candles (clamped to
    /// `len()`), oldest first.
    pub fn iter_last(&self, n: usize) -> impl Iterator<Item = &Candle> + '_ {
        let n = n.min(self.count);
        let skip = self.count - n;
        self.iter().skip(skip)
    }

    /// All retained candles, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Candle> + '_ {
        (0..self.count).filter_map(move |i| self.slots[self.physical_index(i)].as_ref())
    }

    pub fn has_enough_data(&self, n: usize) -> bool {
        self.count >= n
    }

    pub fn oldest(&self) -> Option<&Candle> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.physical_index(0)].as_ref()
    }

    pub fn newest(&self) -> Option<&Candle> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.physical_index(self.count - 1)].as_ref()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Fraction of capacity currently filled, in `0.0..=1.0`.
    pub fn fill_ratio(&self) -> f64 {
        self.count as f64 / self.capacity() as f64
    }

    /// Drop every candle, keeping the allocation.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.count = 0;
    }

    /// Slot of the `i`-th oldest candle.
    fn physical_index(&self, i: usize) -> usize {
        let capacity = self.capacity();
        (self.head + capacity - self.count + i) % capacity
    }
}

impl Default for CandleBuffer {
    fn default() -> Self {
        Self::new(CANDLE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 299_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            quote_volume: close * 10.0,
            is_final: true,
        }
    }

    fn filled(capacity: usize, pushes: usize) -> CandleBuffer {
        let mut buf = CandleBuffer::new(capacity);
        for i in 0..pushes {
            buf.push(sample_candle(i as i64 * 300_000, 100.0 + i as f64));
        }
        buf
    }

    #[test]
    fn push_reports_eviction_only_when_full() {
        let mut buf = CandleBuffer::new(2);
        assert!(buf.push(sample_candle(0, 1.0)).is_none());
        assert!(buf.push(sample_candle(1, 2.0)).is_none());
        let evicted = buf.push(sample_candle(2, 3.0)).expect("full buffer evicts");
        assert_eq!(evicted.open_time, 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn last_n_is_chronological_after_wrap() {
        for extra in [0usize, 1, 5, 288, 1000] {
            let buf = filled(CANDLE_CAPACITY, CANDLE_CAPACITY + extra);
            assert_eq!(buf.len(), CANDLE_CAPACITY);

            let last = buf.get_last_n(CANDLE_CAPACITY).unwrap();
            assert_eq!(last.len(), CANDLE_CAPACITY);
            let first_kept = extra as i64;
            for (i, c) in last.iter().enumerate() {
                assert_eq!(c.open_time, (first_kept + i as i64) * 300_000);
            }
        }
    }

    #[test]
    fn last_n_rejects_more_than_count() {
        let buf = filled(10, 3);
        assert_eq!(
            buf.get_last_n(4),
            Err(BufferError::InsufficientData {
                requested: 4,
                available: 3
            })
        );
        assert_eq!(buf.get_last_n(0).unwrap(), Vec::new());
    }

    #[test]
    fn oldest_and_newest_track_wrap() {
        let mut buf = CandleBuffer::new(3);
        assert!(buf.oldest().is_none());
        assert!(buf.newest().is_none());

        for i in 0..5 {
            buf.push(sample_candle(i, i as f64));
        }
        assert_eq!(buf.oldest().unwrap().open_time, 2);
        assert_eq!(buf.newest().unwrap().open_time, 4);
    }

    #[test]
    fn last_pushed_round_trips() {
        let mut buf = CandleBuffer::new(4);
        let candle = Candle {
            open_time: 42,
            close_time: 43,
            open: 1.5,
            high: 2.5,
            low: 0.5,
            close: 2.0,
            volume: 7.25,
            quote_volume: 14.5,
            is_final: true,
        };
        buf.push(sample_candle(0, 1.0));
        buf.push(candle.clone());
        assert_eq!(buf.get_last_n(1).unwrap(), vec![candle]);
    }

    #[test]
    fn fill_ratio_and_clear() {
        let mut buf = filled(4, 2);
        assert!((buf.fill_ratio() - 0.5).abs() < f64::EPSILON);
        assert!(buf.has_enough_data(2));
        assert!(!buf.has_enough_data(3));

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.fill_ratio(), 0.0);
    }
}
