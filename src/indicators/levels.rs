use crate::models::{Candle, Instrument};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Highest high of the `lookback` candles preceding the last one
///
/// The last candle is the one being evaluated and never part of its own window.
pub fn highest_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    prior_window(candles, lookback).map(|w| w.iter().map(|c| c.high).fold(f64::MIN, f64::max))
}

/// Lowest low of the `lookback` candles preceding the last one
pub fn lowest_low(candles: &[Candle], lookback: usize) -> Option<f64> {
    prior_window(candles, lookback).map(|w| w.iter().map(|c| c.low).fold(f64::MAX, f64::min))
}

fn prior_window(candles: &[Candle], lookback: usize) -> Option<&[Candle]> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }
    let end = candles.len() - 1;
    Some(&candles[end - lookback..end])
}

/// Rolling levels for one instrument, derived from closed candles
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSnapshot {
    pub instrument: Instrument,
    pub highest_high: f64,
    pub lowest_low: f64,
    pub breakout_lookback: usize,
    pub stop_lookback: usize,
    /// Open time of the evaluation candle
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LevelUpdate {
    /// A newer closed candle was seen and the levels were recomputed
    Updated(LevelSnapshot),
    /// Same evaluation candle as last time; nothing recomputed
    Unchanged,
    /// Not enough closed candles yet
    InsufficientData { have: usize, need: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LevelReading<'a> {
    Absent,
    /// A newer candle closed since these levels were computed
    Stale(&'a LevelSnapshot),
    Fresh(&'a LevelSnapshot),
}

impl<'a> LevelReading<'a> {
    pub fn snapshot(&self) -> Option<&'a LevelSnapshot> {
        match self {
            LevelReading::Absent => None,
            LevelReading::Stale(s) | LevelReading::Fresh(s) => Some(s),
        }
    }
}

/// Per-instrument level cache, recomputed once per newly closed candle
#[derive(Debug, Clone)]
pub struct LevelCache {
    breakout_lookback: usize,
    stop_lookback: usize,
    snapshots: HashMap<Instrument, LevelSnapshot>,
    latest_closed: HashMap<Instrument, DateTime<Utc>>,
}

impl LevelCache {
    pub fn new(breakout_lookback: usize, stop_lookback: usize) -> Self {
        Self {
            breakout_lookback,
            stop_lookback,
            snapshots: HashMap::new(),
            latest_closed: HashMap::new(),
        }
    }

    /// `max(N_breakout, N_stop) + 2`
    pub fn min_history(&self) -> usize {
        self.breakout_lookback.max(self.stop_lookback) + 2
    }

    /// Record that a closed candle with this open time exists, without recomputing
    pub fn note_closed(&mut self, instrument: &Instrument, open_time: DateTime<Utc>) {
        let entry = self
            .latest_closed
            .entry(instrument.clone())
            .or_insert(open_time);
        if open_time > *entry {
            *entry = open_time;
        }
    }

    /// Recompute from closed-candle history (oldest first)
    pub fn recompute_levels(&mut self, instrument: &Instrument, candles: &[Candle]) -> LevelUpdate {
        let need = self.min_history();
        let Some(last) = candles.last() else {
            return LevelUpdate::InsufficientData { have: 0, need };
        };
        self.note_closed(instrument, last.open_time);

        if candles.len() < need {
            return LevelUpdate::InsufficientData {
                have: candles.len(),
                need,
            };
        }

        if let Some(existing) = self.snapshots.get(instrument) {
            if existing.as_of >= last.open_time {
                return LevelUpdate::Unchanged;
            }
        }

        let (Some(hh), Some(ll)) = (
            highest_high(candles, self.breakout_lookback),
            lowest_low(candles, self.stop_lookback),
        ) else {
            return LevelUpdate::InsufficientData {
                have: candles.len(),
                need,
            };
        };

        let snapshot = LevelSnapshot {
            instrument: instrument.clone(),
            highest_high: hh,
            lowest_low: ll,
            breakout_lookback: self.breakout_lookback,
            stop_lookback: self.stop_lookback,
            as_of: last.open_time,
        };
        self.snapshots.insert(instrument.clone(), snapshot.clone());

        tracing::debug!(
            symbol = %instrument,
            highest_high = hh,
            lowest_low = ll,
            as_of = %snapshot.as_of,
            "Levels recomputed"
        );

        LevelUpdate::Updated(snapshot)
    }

    pub fn get(&self, instrument: &Instrument) -> LevelReading<'_> {
        match self.snapshots.get(instrument) {
            None => LevelReading::Absent,
            Some(snapshot) => match self.latest_closed.get(instrument) {
                Some(latest) if *latest > snapshot.as_of => LevelReading::Stale(snapshot),
                _ => LevelReading::Fresh(snapshot),
            },
        }
    }
}
