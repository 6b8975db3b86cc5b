use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Account equity tracked for the daily drawdown check
///
/// Equity only moves on realized PnL. The daily baseline resets once per UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityState {
    pub current_equity: f64,
    pub daily_start_equity: f64,
    pub daily_date: NaiveDate,
}

impl EquityState {
    pub fn new(starting_equity: f64, now: DateTime<Utc>) -> Self {
        Self {
            current_equity: starting_equity,
            daily_start_equity: starting_equity,
            daily_date: now.date_naive(),
        }
    }

    /// Start a new day if the UTC date advanced; returns true on rollover
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today > self.daily_date {
            self.daily_date = today;
            self.daily_start_equity = self.current_equity;
            true
        } else {
            false
        }
    }

    pub fn apply_realized(&mut self, pnl: f64) {
        self.current_equity += pnl;
    }

    pub fn daily_pnl_pct(&self) -> f64 {
        if self.daily_start_equity <= 0.0 {
            return 0.0;
        }
        (self.current_equity - self.daily_start_equity) / self.daily_start_equity * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KillSwitchTransition {
    Tripped { daily_pnl_pct: f64 },
    Reset,
    Unchanged,
}

/// Daily drawdown circuit breaker; blocks new entries only
#[derive(Debug, Clone)]
pub struct KillSwitch {
    /// Negative percentage, e.g. -3.0
    threshold_pct: f64,
    tripped: bool,
}

impl KillSwitch {
    pub fn new(threshold_pct: f64) -> Self {
        Self {
            threshold_pct,
            tripped: false,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn threshold_pct(&self) -> f64 {
        self.threshold_pct
    }

    /// Re-check against equity. Trips when `daily_pnl_pct <= threshold`; only a day
    /// rollover clears it.
    pub fn check(&mut self, state: &EquityState) -> KillSwitchTransition {
        let pnl_pct = state.daily_pnl_pct();
        if !self.tripped && pnl_pct <= self.threshold_pct {
            self.tripped = true;
            return KillSwitchTransition::Tripped {
                daily_pnl_pct: pnl_pct,
            };
        }
        KillSwitchTransition::Unchanged
    }

    /// Unconditional reset at the start of a new UTC day
    pub fn reset(&mut self) -> KillSwitchTransition {
        if std::mem::replace(&mut self.tripped, false) {
            KillSwitchTransition::Reset
        } else {
            KillSwitchTransition::Unchanged
        }
    }
}
