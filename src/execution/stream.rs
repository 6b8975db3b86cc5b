//! Binance combined-stream transport: kline and mini-ticker messages

use crate::models::{Candle, Instrument, Timeframe};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

pub const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443";
pub const BINANCE_TESTNET_WS_BASE: &str = "wss://testnet.binance.vision";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("WebSocket stream error: {0}")]
    Stream(String),
}

/// Decoded push message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Kline {
        /// Exchange symbol, e.g. `BTCUSDT`
        symbol: String,
        candle: Candle,
        is_closed: bool,
    },
    Ticker {
        symbol: String,
        price: f64,
        event_time: DateTime<Utc>,
    },
}

/// Combined-stream URL subscribing every instrument to klines and mini tickers
pub fn stream_url(base: &str, instruments: &[Instrument], timeframe: Timeframe) -> String {
    let streams = instruments
        .iter()
        .flat_map(|i| {
            let sym = i.stream_symbol();
            [
                format!("{}@kline_{}", sym, timeframe.as_str()),
                format!("{}@miniTicker", sym),
            ]
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/stream?streams={}", base.trim_end_matches('/'), streams)
}

#[derive(Debug, Deserialize)]
struct CombinedEnvelope {
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    #[serde(rename = "e")]
    event_type: String,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct MiniTickerEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: String,
}

/// Parse a text frame; None for anything that is not a kline or mini-ticker event
pub fn parse_stream_message(text: &str) -> Option<StreamMessage> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    // Combined streams wrap the payload as {"stream": ..., "data": ...}
    let data = match serde_json::from_value::<CombinedEnvelope>(value.clone()) {
        Ok(envelope) => envelope.data,
        Err(_) => value,
    };

    let header: EventHeader = serde_json::from_value(data.clone()).ok()?;
    match header.event_type.as_str() {
        "kline" => {
            let event: KlineEvent = serde_json::from_value(data).ok()?;
            let k = event.kline;
            Some(StreamMessage::Kline {
                symbol: event.symbol,
                candle: Candle {
                    open_time: Utc.timestamp_millis_opt(k.open_time).single()?,
                    close_time: Utc.timestamp_millis_opt(k.close_time).single()?,
                    open: k.open.parse().ok()?,
                    high: k.high.parse().ok()?,
                    low: k.low.parse().ok()?,
                    close: k.close.parse().ok()?,
                    volume: k.volume.parse().ok()?,
                },
                is_closed: k.is_closed,
            })
        }
        "24hrMiniTicker" => {
            let event: MiniTickerEvent = serde_json::from_value(data).ok()?;
            Some(StreamMessage::Ticker {
                symbol: event.symbol,
                price: event.close.parse().ok()?,
                event_time: Utc.timestamp_millis_opt(event.event_time).single()?,
            })
        }
        _ => None,
    }
}
