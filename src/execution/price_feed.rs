use super::stream::{parse_stream_message, FeedError, StreamMessage};
use crate::api::{ExchangeError, MarketDataSource};
use crate::models::{BookTop, Candle, Instrument, Timeframe};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Binance pings every few minutes and tickers arrive every second
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Push transport health, owned by the feed task and read by the control loop
#[derive(Debug, Clone, PartialEq)]
pub struct FeedHealth {
    pub state: ConnectionState,
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            last_message_time: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceReading {
    Live(f64),
    Stale { price: f64, age: chrono::Duration },
    /// No push message yet; caller must pull
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    KlineClosed { instrument: Instrument, candle: Candle },
    /// Forming candle update; best effort
    KlineForming { instrument: Instrument, candle: Candle },
    /// Best effort; the last-value store always has the latest price
    Ticker { instrument: Instrument, price: f64 },
    /// Reconnected and subscribed again; closes during the gap must be re-pulled
    Resubscribed,
}

/// Last-value store written only by the feed task
#[derive(Debug, Default)]
struct FeedState {
    prices: HashMap<Instrument, (f64, DateTime<Utc>)>,
    last_closed: HashMap<Instrument, DateTime<Utc>>,
    health: FeedHealth,
}

impl FeedState {
    fn record_price(&mut self, instrument: &Instrument, price: f64, at: DateTime<Utc>) {
        self.prices.insert(instrument.clone(), (price, at));
    }

    /// True if this closed kline has not been emitted before
    fn accept_closed(&mut self, instrument: &Instrument, open_time: DateTime<Utc>) -> bool {
        match self.last_closed.get(instrument) {
            Some(last) if open_time <= *last => false,
            _ => {
                self.last_closed.insert(instrument.clone(), open_time);
                true
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.health.state = state;
        self.health.connected = state == ConnectionState::Streaming;
        if state == ConnectionState::Streaming {
            self.health.consecutive_failures = 0;
        }
    }
}

type SharedState = Arc<RwLock<FeedState>>;

fn write_state(state: &SharedState) -> RwLockWriteGuard<'_, FeedState> {
    state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_state(state: &SharedState) -> RwLockReadGuard<'_, FeedState> {
    state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub instruments: Vec<Instrument>,
    pub reconnect_delay: Duration,
}

enum StreamExit {
    Shutdown,
    ReceiverDropped,
}

/// Market data: push stream with a pull fallback
///
/// Without a subscription every read falls through to the pull source.
pub struct MarketFeed {
    source: Arc<dyn MarketDataSource>,
    state: SharedState,
    stale_after: chrono::Duration,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MarketFeed {
    pub fn new(source: Arc<dyn MarketDataSource>, stale_after: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            state: Arc::new(RwLock::new(FeedState::default())),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(2)),
            shutdown_tx,
            task: None,
        }
    }

    /// Start the push transport; events arrive on the returned channel
    pub fn subscribe(&mut self, config: StreamConfig) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = self.state.clone();
        let shutdown = self.shutdown_tx.subscribe();

        tracing::info!(
            instruments = config.instruments.len(),
            url = %config.url,
            "Subscribing to market stream"
        );

        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        self.task = Some(tokio::spawn(run_stream(config, state, tx, shutdown)));
        rx
    }

    /// Last pushed price, without blocking
    pub fn current_price(&self, instrument: &Instrument, now: DateTime<Utc>) -> PriceReading {
        match read_state(&self.state).prices.get(instrument) {
            None => PriceReading::Absent,
            Some(&(price, at)) => {
                let age = now - at;
                if age > self.stale_after {
                    PriceReading::Stale { price, age }
                } else {
                    PriceReading::Live(price)
                }
            }
        }
    }

    /// Pushed price if live, otherwise a pull request
    pub async fn price_or_pull(
        &self,
        instrument: &Instrument,
        now: DateTime<Utc>,
    ) -> Result<f64, ExchangeError> {
        match self.current_price(instrument, now) {
            PriceReading::Live(price) => Ok(price),
            _ => self.source.fetch_last_price(instrument).await,
        }
    }

    pub fn health(&self) -> FeedHealth {
        read_state(&self.state).health.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.health().state == ConnectionState::Streaming
    }

    pub async fn fetch_history(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.source.fetch_history(instrument, timeframe, limit).await
    }

    pub async fn fetch_book_top(&self, instrument: &Instrument) -> Result<BookTop, ExchangeError> {
        self.source.fetch_book_top(instrument).await
    }

    /// Stop the stream task, waiting at most two seconds for the connection to close
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let Some(mut handle) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(_) => tracing::info!("Market stream shut down"),
            Err(_) => {
                handle.abort();
                tracing::warn!(
                    grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                    "Market stream did not stop in time, aborted"
                );
            }
        }
    }
}

/// Reconnect loop: fixed delay, unlimited attempts, full resubscription each time
async fn run_stream(
    config: StreamConfig,
    state: SharedState,
    tx: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let symbols: HashMap<String, Instrument> = config
        .instruments
        .iter()
        .map(|i| (i.rest_symbol(), i.clone()))
        .collect();
    let mut has_streamed = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        write_state(&state).set_state(ConnectionState::Connecting);

        match stream_once(&config.url, &symbols, &state, &tx, &mut shutdown, &mut has_streamed).await {
            Ok(StreamExit::Shutdown) => break,
            Ok(StreamExit::ReceiverDropped) => {
                tracing::debug!("Feed receiver dropped, stopping stream");
                break;
            }
            Err(e) => {
                let failures = {
                    let mut guard = write_state(&state);
                    guard.set_state(ConnectionState::Disconnected);
                    guard.health.consecutive_failures += 1;
                    guard.health.consecutive_failures
                };
                tracing::warn!(
                    error = %e,
                    attempt = failures,
                    delay_ms = config.reconnect_delay.as_millis() as u64,
                    "Market stream down, reconnecting"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    write_state(&state).set_state(ConnectionState::Disconnected);
    tracing::info!("Market stream stopped");
}

async fn stream_once(
    url: &str,
    symbols: &HashMap<String, Instrument>,
    state: &SharedState,
    tx: &mpsc::Sender<FeedEvent>,
    shutdown: &mut watch::Receiver<bool>,
    has_streamed: &mut bool,
) -> Result<StreamExit, FeedError> {
    tracing::info!(url = %url, "Connecting market stream");

    let (ws_stream, _response) = tokio::select! {
        res = connect_async(url) => res.map_err(|e| FeedError::Connect(e.to_string()))?,
        _ = shutdown.changed() => return Ok(StreamExit::Shutdown),
    };
    let (mut write, mut read) = ws_stream.split();

    write_state(state).set_state(ConnectionState::Streaming);
    tracing::info!("Market stream connected");

    if std::mem::replace(has_streamed, true) && tx.send(FeedEvent::Resubscribed).await.is_err() {
        return Ok(StreamExit::ReceiverDropped);
    }

    loop {
        tokio::select! {
            msg = tokio::time::timeout(IDLE_TIMEOUT, read.next()) => {
                let msg = msg.map_err(|_| FeedError::Stream("no data within idle timeout".into()))?;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        write_state(state).health.last_message_time = Some(Utc::now());
                        if !dispatch(&text, symbols, state, tx).await {
                            return Ok(StreamExit::ReceiverDropped);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await
                            .map_err(|e| FeedError::Stream(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(FeedError::Stream(format!("closed by server: {:?}", frame)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(FeedError::Stream(e.to_string())),
                    None => return Err(FeedError::Stream("stream ended unexpectedly".into())),
                }
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(StreamExit::Shutdown);
            }
        }
    }
}

/// Apply one text frame to the store and forward events
///
/// Returns false once the receiver is gone.
async fn dispatch(
    text: &str,
    symbols: &HashMap<String, Instrument>,
    state: &SharedState,
    tx: &mpsc::Sender<FeedEvent>,
) -> bool {
    let Some(message) = parse_stream_message(text) else {
        return true;
    };

    match message {
        StreamMessage::Ticker { symbol, price, .. } => {
            let Some(instrument) = symbols.get(&symbol) else {
                return true;
            };
            write_state(state).record_price(instrument, price, Utc::now());
            let event = FeedEvent::Ticker {
                instrument: instrument.clone(),
                price,
            };
            !matches!(tx.try_send(event), Err(TrySendError::Closed(_)))
        }
        StreamMessage::Kline {
            symbol,
            candle,
            is_closed,
        } => {
            let Some(instrument) = symbols.get(&symbol) else {
                return true;
            };
            write_state(state).record_price(instrument, candle.close, Utc::now());

            if !is_closed {
                let event = FeedEvent::KlineForming {
                    instrument: instrument.clone(),
                    candle,
                };
                return !matches!(tx.try_send(event), Err(TrySendError::Closed(_)));
            }

            let fresh = write_state(state).accept_closed(instrument, candle.open_time);
            if !fresh {
                tracing::debug!(
                    symbol = %instrument,
                    open_time = %candle.open_time,
                    "Duplicate kline close ignored"
                );
                return true;
            }

            // Closes are never dropped: wait for room in the channel
            tx.send(FeedEvent::KlineClosed {
                instrument: instrument.clone(),
                candle,
            })
            .await
            .is_ok()
        }
    }
}
