// Entry signal generation
pub mod breakout;

pub use breakout::{BreakoutStrategy, SignalConfig, StopMode};

use crate::models::Candle;

/// Entry/stop/target levels derived from closed-candle history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    /// Breakout condition met on the latest closed candle
    pub entry_ok: bool,
    pub entry_price: f64,
    pub stop_price: f64,
    /// `entry_price - stop_price`
    pub r_value: f64,
    /// `entry_price + take_profit_r * r_value`
    pub target_price: f64,
    pub highest_high: f64,
    pub lowest_low: f64,
}

impl Signal {
    /// Only a breakout with strictly positive risk per unit can be traded
    pub fn is_actionable(&self) -> bool {
        self.entry_ok && self.r_value > 0.0
    }
}

/// Base trait for entry strategies
pub trait Strategy: Send + Sync {
    /// Evaluate the latest closed candle; None when history is too short
    fn generate_signal(&self, candles: &[Candle]) -> Option<Signal>;

    /// Candidate trailing stop for an open long, if the strategy trails
    fn trail_stop(&self, candles: &[Candle]) -> Option<f64>;

    fn name(&self) -> &str;

    /// Minimum closed candles required
    fn min_candles_required(&self) -> usize;
}
