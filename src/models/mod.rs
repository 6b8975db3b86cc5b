use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tradable pair, e.g. `BTC/USDT`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub base: String,
    pub quote: String,
}

impl Instrument {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Display symbol: `BTC/USDT`
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    /// Symbol used by the REST API: `BTCUSDT`
    pub fn rest_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Symbol used in stream names: `btcusdt`
    pub fn stream_symbol(&self) -> String {
        self.rest_symbol().to_lowercase()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("Instrument '{}' must be BASE/QUOTE", s))?;

        if base.is_empty() || quote.is_empty() {
            return Err(format!("Instrument '{}' must be BASE/QUOTE", s));
        }

        Ok(Self::new(base, quote))
    }
}

/// Candle interval, restricted to the intervals the exchange serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    minutes: u32,
}

const TIMEFRAMES: &[(&str, u32)] = &[
    ("1m", 1),
    ("3m", 3),
    ("5m", 5),
    ("15m", 15),
    ("30m", 30),
    ("1h", 60),
    ("2h", 120),
    ("4h", 240),
    ("6h", 360),
    ("8h", 480),
    ("12h", 720),
    ("1d", 1440),
];

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        TIMEFRAMES
            .iter()
            .find(|(_, m)| *m == self.minutes)
            .map(|(label, _)| *label)
            .unwrap_or("1h")
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes as i64)
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe { minutes: 60 }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TIMEFRAMES
            .iter()
            .find(|(label, _)| *label == s.trim())
            .map(|(_, minutes)| Timeframe { minutes: *minutes })
            .ok_or_else(|| format!("Unsupported timeframe '{}'", s))
    }
}

/// OHLCV candle for one instrument/timeframe bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is closed once its close time has passed
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.close_time < now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Best bid/ask at the top of the order book
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BookTop {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

impl BookTop {
    /// Sentinel spread when one side of the book is empty; blocks any entry
    pub const EMPTY_SIDE_SPREAD_PCT: f64 = 999.0;

    pub fn spread_pct(&self) -> f64 {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => {
                let mid = (bid + ask) / 2.0;
                (ask - bid) / mid * 100.0
            }
            _ => Self::EMPTY_SIDE_SPREAD_PCT,
        }
    }
}

/// Exchange trading limits for one instrument
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketRules {
    pub min_cost: Option<f64>,
    pub min_qty: Option<f64>,
    pub qty_step: Option<f64>,
    pub tradable: bool,
}

/// Result of a market order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    /// None when the venue does not report an average price
    pub average_price: Option<f64>,
    pub filled_qty: f64,
}

impl Fill {
    /// Average fill price, falling back to the price we asked for
    pub fn price_or(&self, requested: f64) -> f64 {
        self.average_price.filter(|p| *p > 0.0).unwrap_or(requested)
    }
}
