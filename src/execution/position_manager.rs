use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::gateway::{ExecutionError, ExecutionGateway};
use crate::models::{BookTop, Instrument, MarketRules, Side};
use crate::risk::{floor_to_step, RiskEngine, SizingDecision, SizingRejection};
use crate::strategy::Signal;

/// Quantities below this are treated as fully closed
const QTY_EPSILON: f64 = 1e-12;
/// Closed positions kept in memory; the journal has the full record
const CLOSED_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

/// A long position from entry fill to final exit
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub instrument: Instrument,
    pub side: Side,
    pub entry_price: f64,
    pub original_qty: f64,
    pub remaining_qty: f64,
    /// Only ever ratchets up
    pub stop_price: f64,
    pub target_price: f64,
    pub r_value: f64,
    pub take_profit_fraction: f64,
    pub partial_taken: bool,
    pub qty_step: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.remaining_qty
    }

    fn close(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        self.remaining_qty = 0.0;
        self.status = PositionStatus::Closed;
        self.closed_at = Some(now);
        self.exit_reason = Some(reason);
    }
}

/// Observable state transitions, forwarded to journal, dashboard and alerts
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Entered {
        position_id: Uuid,
        instrument: Instrument,
        price: f64,
        qty: f64,
        stop_price: f64,
        target_price: f64,
    },
    PartialTaken {
        position_id: Uuid,
        instrument: Instrument,
        price: f64,
        qty: f64,
        pnl: f64,
        new_stop: f64,
    },
    StopRaised {
        position_id: Uuid,
        instrument: Instrument,
        from: f64,
        to: f64,
    },
    Exited {
        position_id: Uuid,
        instrument: Instrument,
        price: f64,
        qty: f64,
        pnl: f64,
        reason: ExitReason,
    },
}

impl PositionEvent {
    /// Journal action tag; None for events that are not trades
    pub fn action_tag(&self) -> Option<&'static str> {
        match self {
            PositionEvent::Entered { .. } => Some("enter"),
            PositionEvent::PartialTaken { .. } => Some("partial"),
            PositionEvent::StopRaised { .. } => None,
            PositionEvent::Exited {
                reason: ExitReason::TakeProfit,
                ..
            } => Some("exit"),
            PositionEvent::Exited {
                reason: ExitReason::StopLoss,
                ..
            } => Some("stop"),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        match self {
            PositionEvent::Entered { instrument, .. }
            | PositionEvent::PartialTaken { instrument, .. }
            | PositionEvent::StopRaised { instrument, .. }
            | PositionEvent::Exited { instrument, .. } => instrument,
        }
    }
}

/// Why an entry was not taken this tick; none of these are faults
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    AlreadyOpen,
    KillSwitch,
    NotActionable,
    SpreadTooWide { spread_pct: f64, max_pct: f64 },
    Sizing(SizingRejection),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyOpen => write!(f, "position already open"),
            SkipReason::KillSwitch => write!(f, "kill switch tripped"),
            SkipReason::NotActionable => write!(f, "signal not actionable"),
            SkipReason::SpreadTooWide {
                spread_pct,
                max_pct,
            } => write!(f, "spread {:.3}% above max {:.3}%", spread_pct, max_pct),
            SkipReason::Sizing(rejection) => write!(f, "{}", rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened(PositionEvent),
    Skipped(SkipReason),
}

/// Inputs for a `Flat -> Open` attempt
#[derive(Debug, Clone, Copy)]
pub struct EntryRequest<'a> {
    pub instrument: &'a Instrument,
    pub signal: &'a Signal,
    pub book: BookTop,
    pub rules: &'a MarketRules,
}

/// Result of managing an open position for one tick
///
/// Transitions confirmed before a fault are kept in `events`.
#[derive(Debug, Default)]
pub struct ManageReport {
    pub events: Vec<PositionEvent>,
    pub error: Option<ExecutionError>,
}

/// Owns open positions (one per instrument) and drives their state machine
pub struct PositionManager {
    open: HashMap<Instrument, Position>,
    closed: Vec<Position>,
    max_spread_pct: f64,
    take_profit_fraction: f64,
    total_pnl: f64,
}

impl PositionManager {
    pub fn new(max_spread_pct: f64, take_profit_fraction: f64) -> Self {
        Self {
            open: HashMap::new(),
            closed: Vec::new(),
            max_spread_pct,
            take_profit_fraction: take_profit_fraction.clamp(0.0, 1.0),
            total_pnl: 0.0,
        }
    }

    pub fn has_open_position(&self, instrument: &Instrument) -> bool {
        self.open.contains_key(instrument)
    }

    pub fn has_any_open(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn get_open_position(&self, instrument: &Instrument) -> Option<&Position> {
        self.open.get(instrument)
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.open.values().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    /// Most recent closed positions, oldest first
    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    /// Total realized P&L across all positions
    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }

    /// `Flat -> Open`
    ///
    /// Gates in order: existing position, kill switch, actionable signal, spread, sizing.
    /// The position exists only after a confirmed fill.
    pub async fn try_enter(
        &mut self,
        request: EntryRequest<'_>,
        risk: &RiskEngine,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
    ) -> Result<EntryOutcome, ExecutionError> {
        let EntryRequest {
            instrument,
            signal,
            book,
            rules,
        } = request;

        if self.has_open_position(instrument) {
            return Ok(EntryOutcome::Skipped(SkipReason::AlreadyOpen));
        }
        if risk.is_tripped() {
            return Ok(EntryOutcome::Skipped(SkipReason::KillSwitch));
        }
        if !signal.is_actionable() {
            return Ok(EntryOutcome::Skipped(SkipReason::NotActionable));
        }

        let spread_pct = book.spread_pct();
        if spread_pct > self.max_spread_pct {
            return Ok(EntryOutcome::Skipped(SkipReason::SpreadTooWide {
                spread_pct,
                max_pct: self.max_spread_pct,
            }));
        }

        let qty = match risk.size(signal.entry_price, signal.stop_price, rules) {
            SizingDecision::Size { qty, .. } => qty,
            SizingDecision::Rejected(rejection) => {
                return Ok(EntryOutcome::Skipped(SkipReason::Sizing(rejection)));
            }
        };

        let fill = gateway
            .place_market_order(instrument, Side::Buy, qty, signal.entry_price)
            .await?;
        let entry_price = fill.price_or(signal.entry_price);
        let filled_qty = fill.filled_qty;

        let position = Position {
            id: Uuid::new_v4(),
            instrument: instrument.clone(),
            side: Side::Buy,
            entry_price,
            original_qty: filled_qty,
            remaining_qty: filled_qty,
            stop_price: signal.stop_price,
            target_price: signal.target_price,
            r_value: entry_price - signal.stop_price,
            take_profit_fraction: self.take_profit_fraction,
            partial_taken: false,
            qty_step: rules.qty_step,
            opened_at: now,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            closed_at: None,
            exit_reason: None,
        };

        let event = PositionEvent::Entered {
            position_id: position.id,
            instrument: instrument.clone(),
            price: entry_price,
            qty: filled_qty,
            stop_price: position.stop_price,
            target_price: position.target_price,
        };
        self.open.insert(instrument.clone(), position);

        Ok(EntryOutcome::Opened(event))
    }

    /// `Open -> Open | Closed` for one tick
    ///
    /// Order: partial take-profit, trailing ratchet, stop exit. A failed order leaves
    /// the position as it was before that step.
    pub async fn manage(
        &mut self,
        instrument: &Instrument,
        price: f64,
        trail_candidate: Option<f64>,
        risk: &mut RiskEngine,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
    ) -> ManageReport {
        let mut report = ManageReport::default();
        let Some(mut position) = self.open.get(instrument).cloned() else {
            return report;
        };

        if let Err(e) = self
            .take_partial(&mut position, price, risk, gateway, now, &mut report.events)
            .await
        {
            report.error = Some(e);
            return report;
        }

        if !position.is_closed() {
            if let Some(candidate) = trail_candidate {
                if candidate > position.stop_price {
                    report.events.push(PositionEvent::StopRaised {
                        position_id: position.id,
                        instrument: instrument.clone(),
                        from: position.stop_price,
                        to: candidate,
                    });
                    position.stop_price = candidate;
                }
            }

            if price <= position.stop_price {
                let mut exited = position.clone();
                match self
                    .exit(&mut exited, price, ExitReason::StopLoss, risk, gateway, now)
                    .await
                {
                    Ok(event) => {
                        report.events.push(event);
                        position = exited;
                    }
                    Err(e) => report.error = Some(e),
                }
            }
        }

        self.store(position);
        report
    }

    async fn take_partial(
        &mut self,
        position: &mut Position,
        price: f64,
        risk: &mut RiskEngine,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
        events: &mut Vec<PositionEvent>,
    ) -> Result<(), ExecutionError> {
        if position.partial_taken
            || position.take_profit_fraction <= 0.0
            || position.remaining_qty <= 0.0
            || price < position.target_price
        {
            return Ok(());
        }

        let raw = (position.remaining_qty * position.take_profit_fraction)
            .clamp(0.0, position.remaining_qty);
        let qty = floor_to_step(raw, position.qty_step);

        if qty >= position.remaining_qty - QTY_EPSILON {
            let mut exited = position.clone();
            let event = self
                .exit(&mut exited, price, ExitReason::TakeProfit, risk, gateway, now)
                .await?;
            *position = exited;
            events.push(event);
            return Ok(());
        }
        if qty <= 0.0 {
            tracing::debug!(
                symbol = %position.instrument,
                raw_qty = raw,
                "Partial take-profit rounds to zero, skipped"
            );
            return Ok(());
        }

        let fill = gateway
            .place_market_order(&position.instrument, Side::Sell, qty, price)
            .await?;
        let fill_price = fill.price_or(price);
        let sold = fill.filled_qty.min(position.remaining_qty);
        let pnl = (fill_price - position.entry_price) * sold;

        position.remaining_qty -= sold;
        position.realized_pnl += pnl;
        position.partial_taken = true;
        position.stop_price = position.stop_price.max(position.entry_price);
        risk.record_realized(pnl);
        self.total_pnl += pnl;

        events.push(PositionEvent::PartialTaken {
            position_id: position.id,
            instrument: position.instrument.clone(),
            price: fill_price,
            qty: sold,
            pnl,
            new_stop: position.stop_price,
        });

        if position.remaining_qty <= QTY_EPSILON {
            position.close(ExitReason::TakeProfit, now);
        }
        Ok(())
    }

    /// Sell everything left; the position is only mutated after the fill
    async fn exit(
        &mut self,
        position: &mut Position,
        price: f64,
        reason: ExitReason,
        risk: &mut RiskEngine,
        gateway: &dyn ExecutionGateway,
        now: DateTime<Utc>,
    ) -> Result<PositionEvent, ExecutionError> {
        let fill = gateway
            .place_market_order(&position.instrument, Side::Sell, position.remaining_qty, price)
            .await?;
        let fill_price = fill.price_or(price);
        let sold = fill.filled_qty.min(position.remaining_qty);
        let pnl = (fill_price - position.entry_price) * sold;

        position.remaining_qty -= sold;
        position.realized_pnl += pnl;
        risk.record_realized(pnl);
        self.total_pnl += pnl;

        if position.remaining_qty <= QTY_EPSILON {
            position.close(reason, now);
        } else {
            tracing::warn!(
                symbol = %position.instrument,
                remaining = position.remaining_qty,
                "Exit partially filled, position stays open"
            );
        }

        Ok(PositionEvent::Exited {
            position_id: position.id,
            instrument: position.instrument.clone(),
            price: fill_price,
            qty: sold,
            pnl,
            reason,
        })
    }

    fn store(&mut self, position: Position) {
        if position.is_closed() {
            self.open.remove(&position.instrument);
            self.closed.push(position);
            if self.closed.len() > CLOSED_HISTORY {
                let excess = self.closed.len() - CLOSED_HISTORY;
                self.closed.drain(..excess);
            }
        } else {
            self.open.insert(position.instrument.clone(), position);
        }
    }
}
