use crate::models::{Candle, Instrument};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Series {
    closed: VecDeque<Candle>,
    /// Current bucket, replaced in place until it closes
    forming: Option<Candle>,
}

/// Thread-safe in-memory buffer for candle data
///
/// Keeps a rolling window of closed candles per instrument plus the forming one.
/// Closed candles are immutable once stored.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<Instrument, Series>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of closed candles to keep per instrument
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles: max_candles.max(1),
        }
    }

    /// Replace the closed history for an instrument (cold start, resync after reconnect)
    ///
    /// A forming candle older than the new history is dropped.
    pub fn replace_history(&self, instrument: &Instrument, candles: &[Candle]) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let series = data.entry(instrument.clone()).or_default();

        let mut sorted = candles.to_vec();
        sorted.sort_by_key(|c| c.open_time);
        sorted.dedup_by_key(|c| c.open_time);

        let skip = sorted.len().saturating_sub(self.max_candles);
        series.closed = sorted.into_iter().skip(skip).collect();

        if let (Some(forming), Some(last)) = (&series.forming, series.closed.back()) {
            if forming.open_time <= last.open_time {
                series.forming = None;
            }
        }
        Ok(())
    }

    /// Apply a kline update from the push feed
    ///
    /// Returns true only when a new closed candle was appended. Closed klines at or
    /// before the last stored close are duplicates and ignored.
    pub fn apply_kline(
        &self,
        instrument: &Instrument,
        candle: Candle,
        is_closed: bool,
    ) -> Result<bool, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let series = data.entry(instrument.clone()).or_default();

        let last_closed = series.closed.back().map(|c| c.open_time);
        if last_closed.is_some_and(|t| candle.open_time <= t) {
            return Ok(false);
        }

        if !is_closed {
            series.forming = Some(candle);
            return Ok(false);
        }

        if series
            .forming
            .as_ref()
            .is_some_and(|f| f.open_time <= candle.open_time)
        {
            series.forming = None;
        }

        series.closed.push_back(candle);
        while series.closed.len() > self.max_candles {
            series.closed.pop_front();
        }
        Ok(true)
    }

    /// All closed candles for an instrument, oldest first
    pub fn closed_candles(&self, instrument: &Instrument) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(instrument)
            .map(|s| s.closed.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Closed candles followed by the forming one, for display
    pub fn candles_with_forming(&self, instrument: &Instrument) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(instrument)
            .map(|s| s.closed.iter().chain(s.forming.iter()).cloned().collect())
            .unwrap_or_default())
    }

    /// Get count of closed candles for an instrument
    pub fn candle_count(&self, instrument: &Instrument) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(instrument).map(|s| s.closed.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn create_test_candle(index: i64, price: f64) -> Candle {
        let open_time = base_time() + Duration::minutes(index);
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(1) - Duration::milliseconds(1),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        }
    }

    fn sol() -> Instrument {
        Instrument::new("SOL", "USDT")
    }

    #[test]
    fn test_new_buffer() {
        let buffer = CandleBuffer::new(100);
        assert_eq!(buffer.max_candles, 100);
        assert_eq!(buffer.candle_count(&sol()).unwrap(), 0);
    }

    #[test]
    fn test_apply_closed_kline() {
        let buffer = CandleBuffer::new(100);

        assert!(buffer.apply_kline(&sol(), create_test_candle(0, 100.0), true).unwrap());
        assert!(buffer.apply_kline(&sol(), create_test_candle(1, 101.0), true).unwrap());

        let candles = buffer.closed_candles(&sol()).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.0);
    }

    #[test]
    fn test_duplicate_close_is_ignored() {
        let buffer = CandleBuffer::new(100);
        buffer.apply_kline(&sol(), create_test_candle(0, 100.0), true).unwrap();
        buffer.apply_kline(&sol(), create_test_candle(1, 101.0), true).unwrap();

        // Replayed after a reconnect
        assert!(!buffer.apply_kline(&sol(), create_test_candle(1, 999.0), true).unwrap());
        assert!(!buffer.apply_kline(&sol(), create_test_candle(0, 999.0), true).unwrap());

        let candles = buffer.closed_candles(&sol()).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, 101.0);
    }

    #[test]
    fn test_forming_candle_replaced_then_closed() {
        let buffer = CandleBuffer::new(100);
        buffer.apply_kline(&sol(), create_test_candle(0, 100.0), true).unwrap();

        assert!(!buffer.apply_kline(&sol(), create_test_candle(1, 101.0), false).unwrap());
        assert!(!buffer.apply_kline(&sol(), create_test_candle(1, 102.0), false).unwrap());
        let with_forming = buffer.candles_with_forming(&sol()).unwrap();
        assert_eq!(with_forming.len(), 2);
        assert_eq!(with_forming[1].close, 102.0);

        assert!(buffer.apply_kline(&sol(), create_test_candle(1, 103.0), true).unwrap());
        assert_eq!(buffer.candles_with_forming(&sol()).unwrap().len(), 2);
        assert_eq!(buffer.candle_count(&sol()).unwrap(), 2);
    }

    #[test]
    fn test_max_candles_limit() {
        let buffer = CandleBuffer::new(5);

        for i in 0..10 {
            buffer
                .apply_kline(&sol(), create_test_candle(i, 100.0 + i as f64), true)
                .unwrap();
        }

        let candles = buffer.closed_candles(&sol()).unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_replace_history_trims_and_orders() {
        let buffer = CandleBuffer::new(3);
        let history: Vec<Candle> = (0..5).rev().map(|i| create_test_candle(i, i as f64)).collect();

        buffer.replace_history(&sol(), &history).unwrap();

        let candles = buffer.closed_candles(&sol()).unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 2.0);
        assert_eq!(candles[2].close, 4.0);

        // Stream resumes after the preloaded history
        assert!(!buffer.apply_kline(&sol(), create_test_candle(4, 0.0), true).unwrap());
        assert!(buffer.apply_kline(&sol(), create_test_candle(5, 5.0), true).unwrap());
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let buffer = CandleBuffer::new(100);
        let other = Instrument::new("JUP", "USDT");
        let buffer_clone = buffer.clone();
        let other_clone = other.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                buffer_clone
                    .apply_kline(&other_clone, create_test_candle(i, 1.0), true)
                    .unwrap();
            }
        });

        for i in 0..50 {
            buffer
                .apply_kline(&sol(), create_test_candle(i, 100.0), true)
                .unwrap();
        }

        handle.join().unwrap();

        assert_eq!(buffer.candle_count(&sol()).unwrap(), 50);
        assert_eq!(buffer.candle_count(&other).unwrap(), 50);
    }
}
