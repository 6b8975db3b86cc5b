//! Fixed-cadence driver tying feed, levels, signals, risk and positions together

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::api::ExchangeError;
use crate::config::BotConfig;
use crate::dashboard::{AlertKind, Alerter, FeedMode, StatusSnapshot, TerminalDashboard};
use crate::execution::{
    CandleBuffer, EntryOutcome, EntryRequest, ExecutionGateway, ExitReason, FeedEvent, MarketFeed,
    PositionEvent, PositionManager, PriceReading, SkipReason,
};
use crate::indicators::{LevelCache, LevelUpdate};
use crate::journal::{JournalEntry, TradeJournal};
use crate::models::{Candle, Instrument, MarketRules, Timeframe};
use crate::risk::{KillSwitchTransition, RiskEngine};
use crate::strategy::{BreakoutStrategy, SignalConfig, Strategy};

/// What happened during one tick
#[derive(Debug, Clone)]
pub struct TickReport {
    pub kill_switch: KillSwitchTransition,
    pub events: Vec<PositionEvent>,
    pub skipped: Vec<(Instrument, SkipReason)>,
    pub status: StatusSnapshot,
}

pub struct ControlLoop {
    exchange: String,
    dry_run: bool,
    timeframe: Timeframe,
    history_limit: usize,
    request_timeout: Duration,
    poll_interval: Duration,
    instruments: Vec<Instrument>,
    markets: HashMap<String, MarketRules>,

    feed: MarketFeed,
    feed_events: Option<mpsc::Receiver<FeedEvent>>,
    feed_mode: Option<FeedMode>,
    buffer: CandleBuffer,

    levels: LevelCache,
    strategy: BreakoutStrategy,
    risk: RiskEngine,
    positions: PositionManager,
    gateway: Arc<dyn ExecutionGateway>,

    journal: TradeJournal,
    dashboard: Option<TerminalDashboard>,
    alerter: Alerter,

    last_prices: HashMap<Instrument, f64>,
    last_spreads: HashMap<Instrument, f64>,
    /// Open time of the last candle that reached an entry decision
    last_evaluated: HashMap<Instrument, DateTime<Utc>>,
}

impl ControlLoop {
    pub fn new(
        cfg: &BotConfig,
        instruments: Vec<Instrument>,
        markets: HashMap<String, MarketRules>,
        feed: MarketFeed,
        gateway: Arc<dyn ExecutionGateway>,
        now: DateTime<Utc>,
    ) -> Self {
        let strategy = BreakoutStrategy::new(SignalConfig::from_config(cfg));
        let history_limit = cfg.history_limit.max(strategy.min_candles_required());
        let dry_run = !gateway.is_live();
        let journal = TradeJournal::new(&cfg.journal_csv, dry_run);

        tracing::info!(
            strategy = strategy.name(),
            min_candles = strategy.min_candles_required(),
            history_limit,
            dry_run,
            journal = %journal.path().display(),
            "Control loop ready"
        );

        Self {
            exchange: cfg.exchange.clone(),
            dry_run,
            timeframe: cfg.timeframe,
            history_limit,
            request_timeout: cfg.request_timeout(),
            poll_interval: cfg.poll_interval(),
            instruments,
            markets,
            feed,
            feed_events: None,
            feed_mode: None,
            buffer: CandleBuffer::new(history_limit),
            levels: LevelCache::new(cfg.breakout_lookback, cfg.stop_lookback),
            strategy,
            risk: RiskEngine::new(
                cfg.starting_equity,
                cfg.risk_per_trade_pct,
                cfg.kill_switch_daily_dd_pct,
                now,
            ),
            positions: PositionManager::new(cfg.max_spread_pct, cfg.tp_fraction),
            gateway,
            journal,
            dashboard: Some(TerminalDashboard::new(cfg.dashboard_clear)),
            alerter: Alerter::new(cfg.sound_alerts),
            last_prices: HashMap::new(),
            last_spreads: HashMap::new(),
            last_evaluated: HashMap::new(),
        }
    }

    /// Consume push-feed events; without them the loop polls
    pub fn with_feed_events(mut self, events: mpsc::Receiver<FeedEvent>) -> Self {
        self.feed_events = Some(events);
        self
    }

    pub fn without_dashboard(mut self) -> Self {
        self.dashboard = None;
        self
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    pub fn feed_mode(&self) -> Option<FeedMode> {
        self.feed_mode
    }

    /// Fill the candle buffer from REST; failures leave that instrument empty
    pub async fn preload_history(&mut self) {
        for instrument in self.instruments.clone() {
            if let Some(candles) = self.pull_history(&instrument).await {
                tracing::info!(
                    symbol = %instrument,
                    candles = candles.len(),
                    "History preloaded"
                );
            }
        }
    }

    /// Tick on the poll interval until `shutdown` flips to true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Control loop stopped");
    }

    pub async fn shutdown_feed(&mut self) {
        self.feed.shutdown().await;
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut events = Vec::new();
        let mut skipped = Vec::new();

        let kill_switch = self.risk.refresh(now);
        if matches!(kill_switch, KillSwitchTransition::Tripped { .. }) {
            self.alerter.ring(AlertKind::KillSwitch);
        }

        self.drain_feed_events().await;
        self.update_feed_mode();

        if self.positions.has_any_open() {
            let open: Vec<Instrument> = self
                .positions
                .open_positions()
                .iter()
                .map(|p| p.instrument.clone())
                .collect();
            for instrument in open {
                events.extend(self.manage_position(&instrument, now).await);
            }
        } else if self.risk.is_tripped() {
            tracing::debug!("Kill switch tripped, entry scan skipped");
        } else {
            let (entered, skips) = self.scan_for_entry(now).await;
            events.extend(entered);
            skipped = skips;
        }

        for event in &events {
            self.publish(event, now);
        }

        let status = self.status(now);
        tracing::info!(
            exchange = %status.exchange,
            dry_run = status.dry_run,
            equity = %format!("{:.2}", status.equity),
            daily_pnl_pct = %format!("{:.2}", status.daily_pnl_pct),
            feed = status.feed_mode.as_str(),
            position = %status
                .position
                .as_ref()
                .map(|p| p.instrument.symbol())
                .unwrap_or_else(|| "none".to_string()),
            "STATUS"
        );
        if let Some(dashboard) = &self.dashboard {
            dashboard.render(&status);
        }

        TickReport {
            kill_switch,
            events,
            skipped,
            status,
        }
    }

    async fn drain_feed_events(&mut self) {
        let Some(rx) = self.feed_events.as_mut() else {
            return;
        };

        let mut resync = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                FeedEvent::KlineClosed { instrument, candle } => {
                    let open_time = candle.open_time;
                    match self.buffer.apply_kline(&instrument, candle, true) {
                        Ok(true) => self.levels.note_closed(&instrument, open_time),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(symbol = %instrument, error = %e, "Candle buffer write failed"),
                    }
                }
                FeedEvent::KlineForming { instrument, candle } => {
                    if let Err(e) = self.buffer.apply_kline(&instrument, candle, false) {
                        tracing::warn!(symbol = %instrument, error = %e, "Candle buffer write failed");
                    }
                }
                FeedEvent::Ticker { instrument, price } => {
                    self.last_prices.insert(instrument, price);
                }
                FeedEvent::Resubscribed => resync = true,
            }
        }

        if resync {
            tracing::info!("Market stream resubscribed, re-pulling history");
            for instrument in self.instruments.clone() {
                self.pull_history(&instrument).await;
            }
        }
    }

    fn update_feed_mode(&mut self) {
        let mode = if self.feed_events.is_some() && self.feed.is_streaming() {
            FeedMode::Streaming
        } else {
            FeedMode::Polling
        };
        if self.feed_mode == Some(mode) {
            return;
        }

        match mode {
            FeedMode::Streaming => tracing::info!("Market data from push stream"),
            FeedMode::Polling => {
                let health = self.feed.health();
                tracing::warn!(
                    subscribed = self.feed_events.is_some(),
                    failures = health.consecutive_failures,
                    "Push stream unavailable, polling REST"
                );
            }
        }
        self.feed_mode = Some(mode);
    }

    /// Closed candles from the buffer while streaming, otherwise from REST
    async fn history(&mut self, instrument: &Instrument) -> Option<Vec<Candle>> {
        if self.feed_mode == Some(FeedMode::Streaming) {
            match self.buffer.closed_candles(instrument) {
                Ok(candles) if candles.len() >= self.strategy.min_candles_required() => {
                    return Some(candles)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol = %instrument, error = %e, "Candle buffer read failed"),
            }
        }
        self.pull_history(instrument).await
    }

    async fn pull_history(&mut self, instrument: &Instrument) -> Option<Vec<Candle>> {
        let candles = bounded(
            self.request_timeout,
            "history",
            instrument,
            self.feed
                .fetch_history(instrument, self.timeframe, self.history_limit),
        )
        .await?;

        if let Err(e) = self.buffer.replace_history(instrument, &candles) {
            tracing::warn!(symbol = %instrument, error = %e, "Candle buffer write failed");
        }
        Some(candles)
    }

    async fn manage_position(&mut self, instrument: &Instrument, now: DateTime<Utc>) -> Vec<PositionEvent> {
        let Some(price) = bounded(
            self.request_timeout,
            "price",
            instrument,
            self.feed.price_or_pull(instrument, now),
        )
        .await
        else {
            return Vec::new();
        };
        self.last_prices.insert(instrument.clone(), price);

        // Candles seen while holding count as evaluated, so an exit never re-enters on them
        let trail = match self.history(instrument).await {
            Some(candles) => {
                self.levels.recompute_levels(instrument, &candles);
                if let Some(last) = candles.last() {
                    self.mark_evaluated(instrument, last.open_time);
                }
                self.strategy.trail_stop(&candles)
            }
            None => None,
        };

        let report = self
            .positions
            .manage(
                instrument,
                price,
                trail,
                &mut self.risk,
                self.gateway.as_ref(),
                now,
            )
            .await;

        if let Some(e) = report.error {
            tracing::error!(symbol = %instrument, price, error = %e, "Execution fault while managing position");
        }
        report.events
    }

    fn is_new_candle(&self, instrument: &Instrument, open_time: DateTime<Utc>) -> bool {
        self.last_evaluated
            .get(instrument)
            .map_or(true, |last| open_time > *last)
    }

    fn mark_evaluated(&mut self, instrument: &Instrument, open_time: DateTime<Utc>) {
        let last = self
            .last_evaluated
            .entry(instrument.clone())
            .or_insert(open_time);
        if open_time > *last {
            *last = open_time;
        }
    }

    /// First instrument with an actionable breakout on a new candle wins
    ///
    /// A candle is marked evaluated only once it reaches a decision. Fetch failures and
    /// execution faults leave it pending so the next tick tries again.
    async fn scan_for_entry(
        &mut self,
        now: DateTime<Utc>,
    ) -> (Vec<PositionEvent>, Vec<(Instrument, SkipReason)>) {
        let mut skipped = Vec::new();

        for instrument in self.instruments.clone() {
            let Some(candles) = self.history(&instrument).await else {
                continue;
            };
            if let Some(last) = candles.last() {
                self.last_prices.insert(instrument.clone(), last.close);
            }

            if let LevelUpdate::InsufficientData { have, need } =
                self.levels.recompute_levels(&instrument, &candles)
            {
                tracing::info!(symbol = %instrument, have, need, "Collecting history");
                continue;
            }
            let Some(evaluated) = candles.last().map(|c| c.open_time) else {
                continue;
            };
            if !self.is_new_candle(&instrument, evaluated) {
                continue;
            }

            let Some(signal) = self.strategy.generate_signal(&candles) else {
                continue;
            };
            if !signal.entry_ok {
                self.mark_evaluated(&instrument, evaluated);
                tracing::debug!(
                    symbol = %instrument,
                    close = signal.entry_price,
                    highest_high = signal.highest_high,
                    "No breakout"
                );
                continue;
            }

            let Some(book) = bounded(
                self.request_timeout,
                "order book",
                &instrument,
                self.feed.fetch_book_top(&instrument),
            )
            .await
            else {
                continue;
            };
            self.last_spreads.insert(instrument.clone(), book.spread_pct());

            let rules = self
                .markets
                .get(&instrument.symbol())
                .cloned()
                .unwrap_or_default();
            let request = EntryRequest {
                instrument: &instrument,
                signal: &signal,
                book,
                rules: &rules,
            };

            match self
                .positions
                .try_enter(request, &self.risk, self.gateway.as_ref(), now)
                .await
            {
                Ok(EntryOutcome::Opened(event)) => {
                    self.mark_evaluated(&instrument, evaluated);
                    return (vec![event], skipped);
                }
                Ok(EntryOutcome::Skipped(reason)) => {
                    self.mark_evaluated(&instrument, evaluated);
                    tracing::info!(symbol = %instrument, reason = %reason, "Entry blocked");
                    skipped.push((instrument.clone(), reason));
                }
                Err(e) => {
                    tracing::error!(
                        symbol = %instrument,
                        error = %e,
                        "Execution fault on entry, retrying next tick"
                    );
                }
            }
        }

        (Vec::new(), skipped)
    }

    /// Forward a position event to the log, journal and alerts
    fn publish(&self, event: &PositionEvent, now: DateTime<Utc>) {
        let equity = self.risk.equity();

        let (price, qty, pnl, note, alert) = match event {
            PositionEvent::Entered {
                price,
                qty,
                stop_price,
                target_price,
                ..
            } => (
                *price,
                *qty,
                0.0,
                format!("stop={:.4} tp1={:.4}", stop_price, target_price),
                AlertKind::Enter,
            ),
            PositionEvent::PartialTaken {
                price,
                qty,
                pnl,
                new_stop,
                ..
            } => (
                *price,
                *qty,
                *pnl,
                format!("stop moved to {:.4}", new_stop),
                AlertKind::TakeProfit,
            ),
            PositionEvent::Exited {
                price,
                qty,
                pnl,
                reason,
                ..
            } => match reason {
                ExitReason::StopLoss => (*price, *qty, *pnl, "stop hit".to_string(), AlertKind::Stop),
                ExitReason::TakeProfit => {
                    (*price, *qty, *pnl, "take profit".to_string(), AlertKind::TakeProfit)
                }
            },
            PositionEvent::StopRaised { from, to, .. } => {
                tracing::info!(
                    symbol = %event.instrument(),
                    from = %format!("{:.4}", from),
                    to = %format!("{:.4}", to),
                    "Trailing stop raised"
                );
                return;
            }
        };

        let Some(action) = event.action_tag() else {
            return;
        };
        tracing::info!(
            action = %self.journal.action_label(action),
            symbol = %event.instrument(),
            price,
            qty,
            pnl = %format!("{:.2}", pnl),
            equity = %format!("{:.2}", equity),
            "TRADE"
        );

        self.journal.record(&JournalEntry {
            ts: now,
            instrument: event.instrument().clone(),
            action: action.to_string(),
            price,
            qty,
            realized_pnl: pnl,
            equity,
            note,
        });
        self.alerter.ring(alert);
    }

    fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let position = self.positions.open_positions().first().map(|p| (*p).clone());
        let instrument = position
            .as_ref()
            .map(|p| p.instrument.clone())
            .or_else(|| self.instruments.first().cloned())
            .unwrap_or_else(|| Instrument::new("", ""));

        let price = match self.feed.current_price(&instrument, now) {
            PriceReading::Live(price) => Some(price),
            _ => self.last_prices.get(&instrument).copied(),
        };

        StatusSnapshot {
            exchange: self.exchange.clone(),
            dry_run: self.dry_run,
            equity: self.risk.equity(),
            daily_pnl_pct: self.risk.daily_pnl_pct(),
            kill_switch_tripped: self.risk.is_tripped(),
            feed_mode: self.feed_mode.unwrap_or(FeedMode::Polling),
            price,
            spread_pct: self.last_spreads.get(&instrument).copied(),
            levels: self.levels.get(&instrument).snapshot().cloned(),
            position,
            instrument,
        }
    }
}

/// Bound a read-only exchange call by the request timeout; failures skip dependent logic
async fn bounded<T, F>(timeout: Duration, what: &str, instrument: &Instrument, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(symbol = %instrument, error = %e, "Failed to fetch {}", what);
            None
        }
        Err(_) => {
            tracing::warn!(
                symbol = %instrument,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out fetching {}",
                what
            );
            None
        }
    }
}
