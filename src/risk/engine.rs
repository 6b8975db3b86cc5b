use super::kill_switch::{EquityState, KillSwitch, KillSwitchTransition};
use super::sizing::{position_size, SizingDecision};
use crate::models::MarketRules;
use chrono::{DateTime, Utc};

/// Sizing plus the daily kill switch, over a single equity ledger
///
/// The control loop is the only writer.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    risk_pct: f64,
    equity: EquityState,
    kill_switch: KillSwitch,
}

impl RiskEngine {
    pub fn new(
        starting_equity: f64,
        risk_pct: f64,
        kill_switch_threshold_pct: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            risk_pct,
            equity: EquityState::new(starting_equity, now),
            kill_switch: KillSwitch::new(kill_switch_threshold_pct),
        }
    }

    /// Roll the daily window and re-evaluate the kill switch
    ///
    /// Each transition is logged here exactly once.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> KillSwitchTransition {
        let mut was_reset = false;
        if self.equity.roll_day(now) {
            tracing::info!(
                date = %self.equity.daily_date,
                start_equity = self.equity.daily_start_equity,
                "New trading day, daily equity baseline reset"
            );
            if self.kill_switch.reset() == KillSwitchTransition::Reset {
                tracing::warn!("Kill switch reset at UTC day rollover, new entries allowed");
                was_reset = true;
            }
        }

        match self.kill_switch.check(&self.equity) {
            KillSwitchTransition::Tripped { daily_pnl_pct } => {
                tracing::warn!(
                    daily_pnl_pct = %format!("{:.2}", daily_pnl_pct),
                    threshold_pct = self.kill_switch.threshold_pct(),
                    "Kill switch tripped, new entries blocked until UTC rollover"
                );
                KillSwitchTransition::Tripped { daily_pnl_pct }
            }
            _ if was_reset => KillSwitchTransition::Reset,
            other => other,
        }
    }

    pub fn size(&self, entry: f64, stop: f64, rules: &MarketRules) -> SizingDecision {
        position_size(entry, stop, self.equity.current_equity, self.risk_pct, rules)
    }

    pub fn record_realized(&mut self, pnl: f64) {
        self.equity.apply_realized(pnl);
    }

    pub fn is_tripped(&self) -> bool {
        self.kill_switch.is_tripped()
    }

    pub fn equity(&self) -> f64 {
        self.equity.current_equity
    }

    pub fn daily_pnl_pct(&self) -> f64 {
        self.equity.daily_pnl_pct()
    }
}
