// Technical indicators: ATR and rolling breakout/stop levels
pub mod atr;
pub mod levels;

pub use atr::{calculate_atr, calculate_atr_series, true_ranges, DEFAULT_ATR_PERIOD};
pub use levels::{highest_high, lowest_low, LevelCache, LevelReading, LevelSnapshot, LevelUpdate};
