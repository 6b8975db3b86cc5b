/// Average True Range (ATR) indicator
///
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The first candle has no previous close, so its true range is High - Low.
///
/// Smoothing is Wilder's: an exponential average with `alpha = 1 / period`,
/// seeded with the first true range (no warm-up simple average).
use crate::models::Candle;

pub const DEFAULT_ATR_PERIOD: usize = 14;

/// True range for every candle
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let range = candle.high - candle.low;
            match i.checked_sub(1).map(|p| candles[p].close) {
                Some(prev_close) => range
                    .max((candle.high - prev_close).abs())
                    .max((candle.low - prev_close).abs()),
                None => range,
            }
        })
        .collect()
}

/// Calculate ATR for the given candles
///
/// Returns the latest ATR value, or None if there are fewer than `period + 1` candles
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period).last().copied()
}

/// ATR for every candle, aligned with the input
///
/// Empty if there are fewer than `period + 1` candles.
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let alpha = 1.0 / period as f64;
    let mut series = Vec::with_capacity(candles.len());
    let mut atr: Option<f64> = None;

    for tr in true_ranges(candles) {
        let next = match atr {
            Some(prev) => alpha * tr + (1.0 - alpha) * prev,
            None => tr,
        };
        atr = Some(next);
        series.push(next);
    }

    series
}
