use super::{Signal, Strategy};
use crate::config::BotConfig;
use crate::indicators::{calculate_atr, highest_high, lowest_low, DEFAULT_ATR_PERIOD};
use crate::models::Candle;

/// How the initial stop is placed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopMode {
    /// Lowest low of the stop lookback window
    LowestLow,
    /// `close - multiplier * ATR`
    Atr { multiplier: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub breakout_lookback: usize,
    pub stop_lookback: usize,
    pub stop_mode: StopMode,
    pub take_profit_r: f64,
    pub atr_period: usize,
    /// None disables ATR trailing
    pub trail_atr_mult: Option<f64>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            breakout_lookback: 20,
            stop_lookback: 10,
            stop_mode: StopMode::LowestLow,
            take_profit_r: 1.0,
            atr_period: DEFAULT_ATR_PERIOD,
            trail_atr_mult: Some(2.0),
        }
    }
}

impl SignalConfig {
    pub fn from_config(cfg: &BotConfig) -> Self {
        Self {
            breakout_lookback: cfg.breakout_lookback,
            stop_lookback: cfg.stop_lookback,
            stop_mode: if cfg.use_atr_stop {
                StopMode::Atr {
                    multiplier: cfg.atr_mult,
                }
            } else {
                StopMode::LowestLow
            },
            take_profit_r: cfg.take_profit_r,
            atr_period: DEFAULT_ATR_PERIOD,
            trail_atr_mult: cfg.trailing_use_atr.then_some(cfg.atr_mult),
        }
    }
}

/// Donchian-style breakout: enter when a candle closes above the prior N-candle high
///
/// Pure function of closed-candle history; the last candle is the evaluation candle.
#[derive(Debug, Clone, Default)]
pub struct BreakoutStrategy {
    config: SignalConfig,
}

impl BreakoutStrategy {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }
}

impl Strategy for BreakoutStrategy {
    fn generate_signal(&self, candles: &[Candle]) -> Option<Signal> {
        if candles.len() < self.min_candles_required() {
            return None;
        }

        let last = candles.last()?;
        let hh = highest_high(candles, self.config.breakout_lookback)?;
        let ll = lowest_low(candles, self.config.stop_lookback)?;

        let entry_price = last.close;
        let stop_price = match self.config.stop_mode {
            StopMode::LowestLow => ll,
            StopMode::Atr { multiplier } => {
                entry_price - multiplier * calculate_atr(candles, self.config.atr_period)?
            }
        };
        let r_value = entry_price - stop_price;

        Some(Signal {
            entry_ok: entry_price > hh,
            entry_price,
            stop_price,
            r_value,
            target_price: entry_price + self.config.take_profit_r * r_value,
            highest_high: hh,
            lowest_low: ll,
        })
    }

    fn trail_stop(&self, candles: &[Candle]) -> Option<f64> {
        let multiplier = self.config.trail_atr_mult?;
        let last = candles.last()?;
        let atr = calculate_atr(candles, self.config.atr_period)?;
        Some(last.high - multiplier * atr)
    }

    fn name(&self) -> &str {
        "BreakoutStrategy"
    }

    fn min_candles_required(&self) -> usize {
        let levels = self.config.breakout_lookback.max(self.config.stop_lookback) + 2;
        match self.config.stop_mode {
            StopMode::LowestLow => levels,
            StopMode::Atr { .. } => levels.max(self.config.atr_period + 1),
        }
    }
}
