use super::{ExchangeError, MarketDataSource};
use crate::models::{BookTop, Candle, Fill, Instrument, MarketRules, Side, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

pub const BINANCE_API_BASE: &str = "https://api.binance.com";
pub const BINANCE_TESTNET_API_BASE: &str = "https://testnet.binance.vision";

const REQUESTS_PER_SECOND: u32 = 10;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_KLINES: usize = 1000;
const DEPTH_LIMIT: u32 = 5;
const RECV_WINDOW_MS: u64 = 5000;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key pair for signed endpoints
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BINANCE_API_KEY` / `BINANCE_API_SECRET`; None if either is unset or empty
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("BINANCE_API_KEY").ok()?;
        let secret = std::env::var("BINANCE_API_SECRET").ok()?;
        if key.trim().is_empty() || secret.trim().is_empty() {
            return None;
        }
        Some(Self::new(key.trim(), secret.trim()))
    }

    /// Hex-encoded HMAC-SHA256 of the query string
    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

/// Binance spot REST client
///
/// Cloneable; clones share the HTTP connection pool and the rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default = "default_true")]
    is_spot_trading_allowed: bool,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    min_qty: Option<String>,
    step_size: Option<String>,
    min_notional: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct TickerPriceResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    status: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

fn default_true() -> bool {
    true
}

fn parse_num(raw: &str, field: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Parse(format!("invalid {} '{}'", field, raw)))
}

fn parse_opt_positive(raw: Option<&String>) -> Option<f64> {
    raw.and_then(|s| s.parse::<f64>().ok()).filter(|v| *v > 0.0)
}

fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, ExchangeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ExchangeError::Parse(format!("invalid timestamp {}", ms)))
}

/// Parse one row of `/api/v3/klines`:
/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
pub(crate) fn parse_kline_row(row: &[Value]) -> Result<Candle, ExchangeError> {
    if row.len() < 7 {
        return Err(ExchangeError::Parse(format!(
            "kline row has {} fields, expected at least 7",
            row.len()
        )));
    }

    let time = |v: &Value| {
        v.as_i64()
            .ok_or_else(|| ExchangeError::Parse(format!("kline time not an integer: {}", v)))
            .and_then(ms_to_datetime)
    };
    let num = |v: &Value, field: &str| match v {
        Value::String(s) => parse_num(s, field),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::Parse(format!("invalid {}", field))),
        _ => Err(ExchangeError::Parse(format!("invalid {}: {}", field, v))),
    };

    Ok(Candle {
        open_time: time(&row[0])?,
        open: num(&row[1], "open")?,
        high: num(&row[2], "high")?,
        low: num(&row[3], "low")?,
        close: num(&row[4], "close")?,
        volume: num(&row[5], "volume")?,
        close_time: time(&row[6])?,
    })
}

/// Render a quantity without exponent or trailing zeros
fn format_qty(qty: f64) -> String {
    let s = format!("{:.8}", qty);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

impl BinanceClient {
    /// Client against production or the spot testnet
    pub fn new(
        sandbox: bool,
        timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self, ExchangeError> {
        let base = if sandbox {
            BINANCE_TESTNET_API_BASE
        } else {
            BINANCE_API_BASE
        };
        Self::with_base_url(base, timeout, credentials)
    }

    pub fn with_base_url(
        base_url: &str,
        timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(timeout).build()?;

        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Rate-limited public GET, retried on transient faults
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut attempt = 1;
        loop {
            match self.get_json_once(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    tracing::warn!(
                        path = %path,
                        attempt,
                        max = MAX_RETRIES,
                        backoff_ms,
                        error = %e,
                        "Transient exchange error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::from_response(status.as_u16(), &body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Tradable spot markets keyed by `BASE/QUOTE`
    pub async fn load_markets(&self) -> Result<HashMap<String, MarketRules>, ExchangeError> {
        let info: ExchangeInfoResponse = self.get_json("/api/v3/exchangeInfo", &[]).await?;

        let markets = info
            .symbols
            .into_iter()
            .map(|s| {
                let mut rules = MarketRules {
                    tradable: s.status == "TRADING" && s.is_spot_trading_allowed,
                    ..Default::default()
                };
                for filter in &s.filters {
                    match filter.filter_type.as_str() {
                        "LOT_SIZE" => {
                            rules.min_qty = parse_opt_positive(filter.min_qty.as_ref());
                            rules.qty_step = parse_opt_positive(filter.step_size.as_ref());
                        }
                        "NOTIONAL" | "MIN_NOTIONAL" => {
                            if let Some(min) = parse_opt_positive(filter.min_notional.as_ref()) {
                                rules.min_cost = Some(rules.min_cost.map_or(min, |m| m.max(min)));
                            }
                        }
                        _ => {}
                    }
                }
                (format!("{}/{}", s.base_asset, s.quote_asset), rules)
            })
            .collect::<HashMap<_, _>>();

        tracing::info!(count = markets.len(), "Loaded exchange markets");
        Ok(markets)
    }

    /// Raw klines, including the still-forming last candle
    pub async fn klines(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let limit = limit.clamp(1, MAX_KLINES);
        let rows: Vec<Vec<Value>> = self
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol", instrument.rest_symbol()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let mut candles = rows
            .iter()
            .map(|row| parse_kline_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    /// Best bid/ask from a shallow depth snapshot
    pub async fn book_top(&self, instrument: &Instrument) -> Result<BookTop, ExchangeError> {
        let depth: DepthResponse = self
            .get_json(
                "/api/v3/depth",
                &[
                    ("symbol", instrument.rest_symbol()),
                    ("limit", DEPTH_LIMIT.to_string()),
                ],
            )
            .await?;

        let best = |levels: &[[String; 2]]| -> Result<Option<f64>, ExchangeError> {
            levels
                .first()
                .map(|level| parse_num(&level[0], "depth price"))
                .transpose()
        };

        Ok(BookTop {
            bid: best(&depth.bids)?,
            ask: best(&depth.asks)?,
        })
    }

    pub async fn last_price(&self, instrument: &Instrument) -> Result<f64, ExchangeError> {
        let ticker: TickerPriceResponse = self
            .get_json(
                "/api/v3/ticker/price",
                &[("symbol", instrument.rest_symbol())],
            )
            .await?;
        parse_num(&ticker.price, "price")
    }

    /// Signed market order; never retried
    ///
    /// The average price is `cummulativeQuoteQty / executedQty`. A zero
    /// executed quantity is reported as a fill of zero, not as an error.
    pub async fn market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        qty: f64,
    ) -> Result<Fill, ExchangeError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ExchangeError::MissingCredentials)?;

        self.rate_limiter.until_ready().await;

        let query = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&newOrderRespType=FULL&recvWindow={}&timestamp={}",
            instrument.rest_symbol(),
            side.as_str(),
            format_qty(qty),
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        );
        let signature = credentials.sign(&query)?;
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query, signature
        );

        tracing::debug!(symbol = %instrument, side = side.as_str(), qty, "Submitting market order");

        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::from_response(status.as_u16(), &body));
        }

        let order: OrderResponse = serde_json::from_str(&body)?;
        let filled_qty = parse_num(&order.executed_qty, "executedQty")?;
        let quote_qty = parse_num(&order.cummulative_quote_qty, "cummulativeQuoteQty")?;
        let average_price = (filled_qty > 0.0).then(|| quote_qty / filled_qty);

        tracing::debug!(
            symbol = %instrument,
            status = %order.status,
            filled_qty,
            average_price = ?average_price,
            "Market order acknowledged"
        );

        Ok(Fill {
            average_price,
            filled_qty,
        })
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn fetch_history(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        // One extra row because the forming candle is dropped
        let mut candles = self.klines(instrument, timeframe, limit + 1).await?;
        let now = Utc::now();
        candles.retain(|c| c.is_closed_at(now));
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn fetch_book_top(&self, instrument: &Instrument) -> Result<BookTop, ExchangeError> {
        self.book_top(instrument).await
    }

    async fn fetch_last_price(&self, instrument: &Instrument) -> Result<f64, ExchangeError> {
        self.last_price(instrument).await
    }
}
