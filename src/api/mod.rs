// Exchange REST adapter
pub mod binance;
pub mod error;

pub use binance::{BinanceClient, Credentials};
pub use error::ExchangeError;

use crate::models::{BookTop, Candle, Instrument, Timeframe};
use async_trait::async_trait;

/// Pull-based market data, used for cold start, polling fallback and order-book checks
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Closed candles only, oldest first, at most `limit`
    async fn fetch_history(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_book_top(&self, instrument: &Instrument) -> Result<BookTop, ExchangeError>;

    async fn fetch_last_price(&self, instrument: &Instrument) -> Result<f64, ExchangeError>;
}
