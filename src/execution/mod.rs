// Market data ingestion, order placement and the position state machine
pub mod candle_buffer;
pub mod gateway;
pub mod position_manager;
pub mod price_feed;
pub mod stream;

pub use candle_buffer::CandleBuffer;
pub use gateway::{DryRunGateway, ExecutionError, ExecutionGateway, LiveGateway};
pub use position_manager::{
    EntryOutcome, EntryRequest, ExitReason, ManageReport, Position, PositionEvent, PositionManager,
    PositionStatus, SkipReason,
};
pub use price_feed::{
    ConnectionState, FeedEvent, FeedHealth, MarketFeed, PriceReading, StreamConfig,
};
pub use stream::{stream_url, FeedError, StreamMessage, BINANCE_TESTNET_WS_BASE, BINANCE_WS_BASE};
