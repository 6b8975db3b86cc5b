use async_trait::async_trait;
use breakout_bot::api::{ExchangeError, MarketDataSource};
use breakout_bot::config::BotConfig;
use breakout_bot::control_loop::ControlLoop;
use breakout_bot::dashboard::FeedMode;
use breakout_bot::execution::{
    DryRunGateway, ExecutionError, ExecutionGateway, ExitReason, FeedEvent, MarketFeed,
    PositionEvent, SkipReason, StreamConfig,
};
use breakout_bot::journal::JOURNAL_HEADER;
use breakout_bot::models::{BookTop, Candle, Fill, Instrument, Side, Timeframe};
use breakout_bot::risk::KillSwitchTransition;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// In-memory market data, mutated by the tests between ticks
#[derive(Default)]
struct FakeMarket {
    history: Mutex<HashMap<Instrument, Vec<Candle>>>,
    prices: Mutex<HashMap<Instrument, f64>>,
    books: Mutex<HashMap<Instrument, BookTop>>,
    /// Order book requests time out while set
    book_down: AtomicBool,
}

impl FakeMarket {
    fn set_history(&self, instrument: &Instrument, candles: Vec<Candle>) {
        self.history.lock().unwrap().insert(instrument.clone(), candles);
    }

    fn push_candle(&self, instrument: &Instrument, candle: Candle) {
        self.history
            .lock()
            .unwrap()
            .entry(instrument.clone())
            .or_default()
            .push(candle);
    }

    fn set_price(&self, instrument: &Instrument, price: f64) {
        self.prices.lock().unwrap().insert(instrument.clone(), price);
    }

    fn set_book(&self, instrument: &Instrument, book: BookTop) {
        self.books.lock().unwrap().insert(instrument.clone(), book);
    }
}

#[async_trait]
impl MarketDataSource for FakeMarket {
    async fn fetch_history(
        &self,
        instrument: &Instrument,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let history = self.history.lock().unwrap();
        let candles = history.get(instrument).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn fetch_book_top(&self, instrument: &Instrument) -> Result<BookTop, ExchangeError> {
        if self.book_down.load(Ordering::SeqCst) {
            return Err(ExchangeError::Timeout);
        }
        if let Some(book) = self.books.lock().unwrap().get(instrument) {
            return Ok(*book);
        }
        let last = self
            .history
            .lock()
            .unwrap()
            .get(instrument)
            .and_then(|c| c.last().map(|c| c.close))
            .ok_or_else(|| ExchangeError::Parse("no data".into()))?;
        Ok(BookTop {
            bid: Some(last - 0.01),
            ask: Some(last + 0.01),
        })
    }

    async fn fetch_last_price(&self, instrument: &Instrument) -> Result<f64, ExchangeError> {
        self.prices
            .lock()
            .unwrap()
            .get(instrument)
            .copied()
            .ok_or_else(|| ExchangeError::Parse("no price".into()))
    }
}

/// Dry-run fills with switchable faults
#[derive(Default)]
struct ScriptedGateway {
    /// Every order fails while set
    failing: AtomicBool,
    /// The next sell fills only half its quantity
    halve_next_sell: AtomicBool,
}

#[async_trait]
impl ExecutionGateway for ScriptedGateway {
    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        qty: f64,
        reference_price: f64,
    ) -> Result<Fill, ExecutionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExecutionError::Transport("connection reset".into()));
        }
        let qty = if matches!(side, Side::Sell) && self.halve_next_sell.swap(false, Ordering::SeqCst) {
            qty / 2.0
        } else {
            qty
        };
        DryRunGateway
            .place_market_order(instrument, side, qty, reference_price)
            .await
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// Accepts WebSocket clients and holds them open without sending anything
async fn silent_stream_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await {
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                }
            });
        }
    });
    format!("ws://{}/stream", addr)
}

fn btc() -> Instrument {
    Instrument::new("BTC", "USDT")
}

fn eth() -> Instrument {
    Instrument::new("ETH", "USDT")
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn candle(index: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    let open_time = t0() - Duration::hours(24) + Duration::hours(index);
    Candle {
        open_time,
        close_time: open_time + Duration::hours(1) - Duration::milliseconds(1),
        open,
        high,
        low,
        close,
        volume: 10.0,
    }
}

/// Ten quiet candles (high 101, low 99) then a close at 103
///
/// With lookbacks 5/3: HH = 101, LL = 99, entry 103, stop 99, R = 4, target 107, size 25.
fn breakout_history() -> Vec<Candle> {
    let mut candles: Vec<Candle> = (0..10).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect();
    candles.push(candle(10, 100.5, 103.5, 100.0, 103.0));
    candles
}

fn quiet_history() -> Vec<Candle> {
    (0..11).map(|i| candle(i, 100.0, 101.0, 99.0, 100.0)).collect()
}

fn test_config(journal: &Path, symbols: &[&str]) -> BotConfig {
    BotConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        breakout_lookback: 5,
        stop_lookback: 3,
        trailing_use_atr: false,
        use_websocket: false,
        sound_alerts: false,
        dashboard_clear: false,
        journal_csv: journal.display().to_string(),
        ..Default::default()
    }
}

fn build_loop(cfg: &BotConfig, market: &Arc<FakeMarket>, instruments: Vec<Instrument>) -> ControlLoop {
    build_loop_with_gateway(cfg, market, instruments, Arc::new(DryRunGateway))
}

fn build_loop_with_gateway(
    cfg: &BotConfig,
    market: &Arc<FakeMarket>,
    instruments: Vec<Instrument>,
    gateway: Arc<dyn ExecutionGateway>,
) -> ControlLoop {
    let source: Arc<dyn MarketDataSource> = market.clone();
    let feed = MarketFeed::new(source, std::time::Duration::from_secs(120));
    ControlLoop::new(cfg, instruments, HashMap::new(), feed, gateway, t0()).without_dashboard()
}

#[tokio::test]
async fn test_breakout_entry_is_sized_and_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("trades.csv");
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let cfg = test_config(&journal, &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);

    let report = bot.tick(t0()).await;

    assert_eq!(report.events.len(), 1);
    match &report.events[0] {
        PositionEvent::Entered {
            price,
            qty,
            stop_price,
            target_price,
            ..
        } => {
            assert_eq!(*price, 103.0);
            assert!((qty - 25.0).abs() < 1e-6);
            assert_eq!(*stop_price, 99.0);
            assert_eq!(*target_price, 107.0);
        }
        other => panic!("expected entry, got {other:?}"),
    }
    assert!(bot.positions().has_open_position(&btc()));

    let levels = report.status.levels.expect("levels computed");
    assert_eq!(levels.highest_high, 101.0);
    assert_eq!(levels.lowest_low, 99.0);

    let rows = tokio_test::assert_ok!(std::fs::read_to_string(&journal));
    let lines: Vec<&str> = rows.lines().collect();
    assert_eq!(lines[0], JOURNAL_HEADER);
    assert!(lines[1].contains(",BTC/USDT,enter_sim,103.00000000,"));
    assert!(lines[1].ends_with("stop=99.0000 tp1=107.0000"));
}

#[tokio::test]
async fn test_same_candle_is_not_reevaluated() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());
    market.set_book(
        &btc(),
        BookTop {
            bid: Some(100.0),
            ask: Some(106.0),
        },
    );

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);

    let report = bot.tick(t0()).await;
    assert!(report.events.is_empty());
    assert!(matches!(
        report.skipped.as_slice(),
        [(_, SkipReason::SpreadTooWide { .. })]
    ));

    // Spread recovers, but the breakout candle was already evaluated
    market.books.lock().unwrap().clear();
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert!(report.events.is_empty());
    assert!(report.skipped.is_empty());
    assert!(!bot.positions().has_any_open());
}

#[tokio::test]
async fn test_partial_take_profit_then_breakeven_stop() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("trades.csv");
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let cfg = test_config(&journal, &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);
    bot.tick(t0()).await;

    market.set_price(&btc(), 107.5);
    let report = bot.tick(t0() + Duration::minutes(1)).await;

    assert_eq!(report.events.len(), 1);
    assert!(matches!(
        report.events[0],
        PositionEvent::PartialTaken { qty, new_stop, .. }
            if (qty - 12.5).abs() < 1e-6 && new_stop == 103.0
    ));
    let position = bot.positions().get_open_position(&btc()).unwrap();
    assert!((position.remaining_qty - 12.5).abs() < 1e-6);
    assert!(position.stop_price >= position.entry_price);
    // 12.5 units * 4.5
    assert!((bot.risk().equity() - 10_056.25).abs() < 1e-6);

    // Pullback to breakeven closes the rest flat
    market.set_price(&btc(), 102.9);
    let report = bot.tick(t0() + Duration::minutes(2)).await;
    assert!(matches!(
        report.events.as_slice(),
        [PositionEvent::Exited {
            reason: ExitReason::StopLoss,
            ..
        }]
    ));
    assert!(!bot.positions().has_any_open());

    let rows = std::fs::read_to_string(&journal).unwrap();
    let actions: Vec<&str> = rows
        .lines()
        .skip(1)
        .map(|l| l.split(',').nth(2).unwrap())
        .collect();
    assert_eq!(actions, vec!["enter_sim", "partial_sim", "stop_sim"]);
}

#[tokio::test]
async fn test_stop_exit_realizes_loss() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);
    bot.tick(t0()).await;

    market.set_price(&btc(), 98.5);
    let report = bot.tick(t0() + Duration::minutes(1)).await;

    match report.events.as_slice() {
        [PositionEvent::Exited { qty, pnl, reason, .. }] => {
            assert_eq!(*reason, ExitReason::StopLoss);
            assert!((qty - 25.0).abs() < 1e-6);
            assert!((pnl + 112.5).abs() < 1e-6);
        }
        other => panic!("expected stop exit, got {other:?}"),
    }
    assert!((bot.risk().equity() - 9_887.5).abs() < 1e-6);

    let closed = &bot.positions().closed_positions()[0];
    assert!(closed.is_closed());
    assert_eq!(closed.remaining_qty, 0.0);
    assert!(report.status.position.is_none());
}

#[tokio::test]
async fn test_price_unavailable_skips_management() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);
    bot.tick(t0()).await;

    // No last price: the tick skips position logic instead of failing
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert!(report.events.is_empty());
    assert!(bot.positions().has_open_position(&btc()));
}

#[tokio::test]
async fn test_kill_switch_blocks_entries_until_rollover() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let mut cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    cfg.kill_switch_daily_dd_pct = -1.0;
    let mut bot = build_loop(&cfg, &market, vec![btc()]);

    bot.tick(t0()).await;
    market.set_price(&btc(), 98.0);
    bot.tick(t0() + Duration::minutes(1)).await;
    // -125 on 10 000
    assert!((bot.risk().daily_pnl_pct() + 1.25).abs() < 1e-9);

    // New breakout while tripped
    market.push_candle(&btc(), candle(11, 103.0, 105.5, 103.0, 105.0));
    let report = bot.tick(t0() + Duration::minutes(2)).await;
    assert!(matches!(report.kill_switch, KillSwitchTransition::Tripped { .. }));
    assert!(report.status.kill_switch_tripped);
    assert!(report.events.is_empty());
    assert!(!bot.positions().has_any_open());

    let report = bot.tick(t0() + Duration::minutes(3)).await;
    assert_eq!(report.kill_switch, KillSwitchTransition::Unchanged);
    assert!(report.events.is_empty());

    // Next UTC day
    let report = bot.tick(t0() + Duration::hours(12) + Duration::minutes(5)).await;
    assert_eq!(report.kill_switch, KillSwitchTransition::Reset);
    assert!(!bot.risk().is_tripped());
    assert!(matches!(report.events.as_slice(), [PositionEvent::Entered { price, .. }] if *price == 105.0));
}

#[tokio::test]
async fn test_first_matching_instrument_wins() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());
    market.set_history(&eth(), breakout_history());

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT", "ETH/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc(), eth()]);

    let report = bot.tick(t0()).await;

    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].instrument(), &btc());
    assert!(bot.positions().has_open_position(&btc()));
    assert!(!bot.positions().has_open_position(&eth()));
}

#[tokio::test]
async fn test_scan_moves_past_quiet_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), quiet_history());
    market.set_history(&eth(), breakout_history());

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT", "ETH/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc(), eth()]);

    let report = bot.tick(t0()).await;

    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].instrument(), &eth());
}

#[tokio::test]
async fn test_insufficient_history_waits() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    let mut short = breakout_history();
    short.drain(..6);
    market.set_history(&btc(), short);

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);

    let report = bot.tick(t0()).await;

    assert!(report.events.is_empty());
    assert!(report.status.levels.is_none());
    assert_eq!(bot.feed_mode(), Some(FeedMode::Polling));
}

#[tokio::test]
async fn test_preload_fills_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);
    bot.preload_history().await;

    assert_eq!(bot.buffer().candle_count(&btc()).unwrap(), 11);
}

#[tokio::test]
async fn test_breakout_survives_order_book_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());
    market.book_down.store(true, Ordering::SeqCst);

    let cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    let mut bot = build_loop(&cfg, &market, vec![btc()]);

    let report = bot.tick(t0()).await;
    assert!(report.events.is_empty());
    assert!(report.skipped.is_empty());
    assert!(!bot.positions().has_any_open());

    // Same candle, book reachable again
    market.book_down.store(false, Ordering::SeqCst);
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert!(matches!(
        report.events.as_slice(),
        [PositionEvent::Entered { price, .. }] if *price == 103.0
    ));
    assert!(bot.positions().has_open_position(&btc()));
}

#[tokio::test]
async fn test_breakout_retried_after_entry_fault() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("trades.csv");
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let gateway = Arc::new(ScriptedGateway::default());
    gateway.failing.store(true, Ordering::SeqCst);

    let cfg = test_config(&journal, &["BTC/USDT"]);
    let mut bot = build_loop_with_gateway(&cfg, &market, vec![btc()], gateway.clone());

    let report = bot.tick(t0()).await;
    assert!(report.events.is_empty());
    assert!(!bot.positions().has_any_open());
    assert!(!journal.exists());

    gateway.failing.store(false, Ordering::SeqCst);
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert_eq!(report.events.len(), 1);
    assert!(bot.positions().has_open_position(&btc()));

    let rows = std::fs::read_to_string(&journal).unwrap();
    assert_eq!(rows.lines().count(), 2);
}

#[tokio::test]
async fn test_open_position_managed_while_kill_switch_tripped() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("trades.csv");
    let market = Arc::new(FakeMarket::default());
    market.set_history(&btc(), breakout_history());

    let gateway = Arc::new(ScriptedGateway::default());
    let mut cfg = test_config(&journal, &["BTC/USDT"]);
    cfg.kill_switch_daily_dd_pct = -0.5;
    let mut bot = build_loop_with_gateway(&cfg, &market, vec![btc()], gateway.clone());
    bot.tick(t0()).await;

    // Stop hit, but only half the exit fills: -4.5 * 12.5 = -56.25
    gateway.halve_next_sell.store(true, Ordering::SeqCst);
    market.set_price(&btc(), 98.5);
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert!(matches!(
        report.events.as_slice(),
        [PositionEvent::Exited { qty, .. }] if (qty - 12.5).abs() < 1e-6
    ));
    let position = bot.positions().get_open_position(&btc()).unwrap();
    assert!((position.remaining_qty - 12.5).abs() < 1e-6);
    assert!(!bot.risk().is_tripped());

    // -0.5625 % trips the switch; the rest of the position is still stopped out
    let report = bot.tick(t0() + Duration::minutes(2)).await;
    assert!(matches!(report.kill_switch, KillSwitchTransition::Tripped { .. }));
    assert!(matches!(
        report.events.as_slice(),
        [PositionEvent::Exited {
            reason: ExitReason::StopLoss,
            qty,
            ..
        }] if (qty - 12.5).abs() < 1e-6
    ));
    assert!(!bot.positions().has_any_open());
    assert!(bot.risk().is_tripped());
    assert!((bot.risk().equity() - 9_887.5).abs() < 1e-6);

    let rows = std::fs::read_to_string(&journal).unwrap();
    let actions: Vec<&str> = rows
        .lines()
        .skip(1)
        .map(|l| l.split(',').nth(2).unwrap())
        .collect();
    assert_eq!(actions, vec!["enter_sim", "stop_sim", "stop_sim"]);
}

#[tokio::test]
async fn test_streamed_closes_drive_a_single_entry() {
    let dir = tempfile::tempdir().unwrap();
    let market = Arc::new(FakeMarket::default());
    let mut quiet = breakout_history();
    let breakout = quiet.pop().unwrap();
    // REST only knows the quiet candles; the breakout arrives over the stream
    market.set_history(&btc(), quiet);

    let mut cfg = test_config(&dir.path().join("trades.csv"), &["BTC/USDT"]);
    cfg.use_websocket = true;

    let source: Arc<dyn MarketDataSource> = market.clone();
    let mut feed = MarketFeed::new(source, std::time::Duration::from_secs(120));
    let _stream_events = feed.subscribe(StreamConfig {
        url: silent_stream_server().await,
        instruments: vec![btc()],
        reconnect_delay: std::time::Duration::from_millis(50),
    });
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !feed.is_streaming() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream connects");

    let (tx, rx) = mpsc::channel(16);
    let mut bot = ControlLoop::new(
        &cfg,
        vec![btc()],
        HashMap::new(),
        feed,
        Arc::new(DryRunGateway),
        t0(),
    )
    .without_dashboard()
    .with_feed_events(rx);
    bot.preload_history().await;

    let report = bot.tick(t0()).await;
    assert_eq!(bot.feed_mode(), Some(FeedMode::Streaming));
    assert_eq!(report.status.feed_mode, FeedMode::Streaming);
    assert!(report.events.is_empty());

    // Same close delivered twice
    for _ in 0..2 {
        tx.send(FeedEvent::KlineClosed {
            instrument: btc(),
            candle: breakout.clone(),
        })
        .await
        .unwrap();
    }
    let report = bot.tick(t0() + Duration::minutes(1)).await;
    assert!(matches!(
        report.events.as_slice(),
        [PositionEvent::Entered { price, .. }] if *price == 103.0
    ));
    assert_eq!(bot.buffer().candle_count(&btc()).unwrap(), 11);

    // Reconnect: history is re-pulled and the replayed close is ignored
    market.set_history(&btc(), breakout_history());
    market.set_price(&btc(), 104.0);
    tx.send(FeedEvent::Resubscribed).await.unwrap();
    tx.send(FeedEvent::KlineClosed {
        instrument: btc(),
        candle: breakout.clone(),
    })
    .await
    .unwrap();
    let report = bot.tick(t0() + Duration::minutes(2)).await;
    assert!(report.events.is_empty());
    assert_eq!(bot.positions().open_positions().len(), 1);
    assert_eq!(bot.buffer().candle_count(&btc()).unwrap(), 11);

    // Stream gone: the loop falls back to polling
    bot.shutdown_feed().await;
    let report = bot.tick(t0() + Duration::minutes(3)).await;
    assert_eq!(bot.feed_mode(), Some(FeedMode::Polling));
    assert!(report.events.is_empty());
    assert!(bot.positions().has_open_position(&btc()));
}
