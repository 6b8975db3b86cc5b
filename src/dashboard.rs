//! Terminal status table and bell alerts

use crate::execution::Position;
use crate::indicators::LevelSnapshot;
use crate::models::Instrument;
use crate::Result;
use std::io::{self, Write};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const BELL: &str = "\x07";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Streaming,
    /// Push feed disabled or down; history and prices come from REST
    Polling,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Streaming => "websocket",
            FeedMode::Polling => "polling",
        }
    }
}

/// Read-only view of the bot, built once per tick
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub exchange: String,
    pub dry_run: bool,
    pub equity: f64,
    pub daily_pnl_pct: f64,
    pub kill_switch_tripped: bool,
    pub feed_mode: FeedMode,
    /// First configured instrument, shown with price, spread and levels
    pub instrument: Instrument,
    pub price: Option<f64>,
    pub spread_pct: Option<f64>,
    pub levels: Option<LevelSnapshot>,
    pub position: Option<Position>,
}

impl StatusSnapshot {
    /// Key/value rows in display order
    pub fn rows(&self) -> Vec<(String, String)> {
        let sym = self.instrument.symbol();
        let mut rows = vec![
            ("Exchange".to_string(), self.exchange.clone()),
            ("Dry run".to_string(), self.dry_run.to_string()),
            ("Equity".to_string(), format!("{:.2}", self.equity)),
            ("Daily PnL".to_string(), format!("{:.2}%", self.daily_pnl_pct)),
            (
                "Kill switch".to_string(),
                if self.kill_switch_tripped { "TRIPPED" } else { "ok" }.to_string(),
            ),
            ("Feed".to_string(), self.feed_mode.as_str().to_string()),
            (
                format!("Price ({})", sym),
                self.price
                    .map(|p| format!("{:.4}", p))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
            (
                "Spread".to_string(),
                self.spread_pct
                    .map(|s| format!("{:.3}%", s))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
        ];

        match &self.levels {
            Some(levels) => {
                rows.push((
                    format!("HH{} ({})", levels.breakout_lookback, sym),
                    format!("{:.4}  (close above enters)", levels.highest_high),
                ));
                rows.push((
                    format!("LL{} ({})", levels.stop_lookback, sym),
                    format!("{:.4}  (initial stop)", levels.lowest_low),
                ));
            }
            None => rows.push((
                "HH/LL".to_string(),
                "waiting for first computation".to_string(),
            )),
        }

        let position = match &self.position {
            Some(p) => format!(
                "{} entry={:.2} stop={:.2} tp1={:.2} qty={:.8}",
                p.instrument, p.entry_price, p.stop_price, p.target_price, p.remaining_qty
            ),
            None => "none".to_string(),
        };
        rows.push(("Position".to_string(), position));

        if let (Some(p), Some(price)) = (&self.position, self.price) {
            rows.push((
                "Unrealized PnL".to_string(),
                format!("{:.2}", p.unrealized_pnl(price)),
            ));
        }

        rows
    }
}

pub struct TerminalDashboard {
    clear: bool,
}

impl TerminalDashboard {
    pub fn new(clear: bool) -> Self {
        Self { clear }
    }

    pub fn render_to<W: Write>(&self, snapshot: &StatusSnapshot, out: &mut W) -> Result<()> {
        if self.clear {
            write!(out, "{}", CLEAR_SCREEN)?;
        }

        let rows = snapshot.rows();
        let key_width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

        writeln!(out, "Bot status")?;
        for (key, value) in &rows {
            writeln!(out, "  {:<width$}  {}", key, value, width = key_width)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Render to stdout; failures are logged and never propagate
    pub fn render(&self, snapshot: &StatusSnapshot) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        if let Err(e) = self.render_to(snapshot, &mut handle) {
            tracing::warn!(error = %e, "Dashboard render failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Enter,
    TakeProfit,
    Stop,
    KillSwitch,
}

pub struct Alerter {
    enabled: bool,
}

impl Alerter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn ring_to<W: Write>(&self, kind: AlertKind, out: &mut W) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        tracing::debug!(?kind, "Alert");
        write!(out, "{}", BELL)?;
        out.flush()?;
        Ok(())
    }

    pub fn ring(&self, kind: AlertKind) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        if let Err(e) = self.ring_to(kind, &mut handle) {
            tracing::warn!(error = %e, "Alert failed");
        }
    }
}
