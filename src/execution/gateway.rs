use crate::api::{BinanceClient, ExchangeError};
use crate::models::{Fill, Instrument, Side};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The venue refused the order; retrying the same order will not help
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// Network or venue fault; the order may or may not have reached the book
    #[error("Order transport failure: {0}")]
    Transport(String),

    #[error("Order for {qty} {instrument} {side:?} was not filled")]
    ZeroFill {
        instrument: Instrument,
        side: Side,
        qty: f64,
    },
}

impl From<ExchangeError> for ExecutionError {
    fn from(e: ExchangeError) -> Self {
        if e.is_transient() {
            ExecutionError::Transport(e.to_string())
        } else {
            match e {
                ExchangeError::Http(_) | ExchangeError::Timeout => {
                    ExecutionError::Transport(e.to_string())
                }
                other => ExecutionError::Rejected(other.to_string()),
            }
        }
    }
}

/// Places market orders; simulated or real
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// `reference_price` is the price the caller expects; dry runs fill at it
    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        qty: f64,
        reference_price: f64,
    ) -> Result<Fill, ExecutionError>;

    fn is_live(&self) -> bool;
}

/// Simulated fills at the reference price, full quantity
#[derive(Debug, Clone, Default)]
pub struct DryRunGateway;

#[async_trait]
impl ExecutionGateway for DryRunGateway {
    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        qty: f64,
        reference_price: f64,
    ) -> Result<Fill, ExecutionError> {
        if qty <= 0.0 {
            return Err(ExecutionError::Rejected(format!(
                "quantity must be positive, got {}",
                qty
            )));
        }

        tracing::debug!(
            symbol = %instrument,
            side = side.as_str(),
            qty,
            price = reference_price,
            "Simulated market order"
        );

        Ok(Fill {
            average_price: Some(reference_price),
            filled_qty: qty,
        })
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// Real orders through the exchange REST adapter
#[derive(Clone)]
pub struct LiveGateway {
    client: BinanceClient,
}

impl LiveGateway {
    pub fn new(client: BinanceClient) -> Result<Self, ExchangeError> {
        if !client.has_credentials() {
            return Err(ExchangeError::MissingCredentials);
        }
        Ok(Self { client })
    }
}

#[async_trait]
impl ExecutionGateway for LiveGateway {
    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        qty: f64,
        _reference_price: f64,
    ) -> Result<Fill, ExecutionError> {
        let fill = self.client.market_order(instrument, side, qty).await?;

        if fill.filled_qty <= 0.0 {
            return Err(ExecutionError::ZeroFill {
                instrument: instrument.clone(),
                side,
                qty,
            });
        }
        if fill.filled_qty < qty {
            tracing::warn!(
                symbol = %instrument,
                side = side.as_str(),
                requested = qty,
                filled = fill.filled_qty,
                "Partial fill"
            );
        }
        Ok(fill)
    }

    fn is_live(&self) -> bool {
        true
    }
}
