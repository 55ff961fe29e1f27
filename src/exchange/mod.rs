//! Exchange capability interface
//!
//! The trade manager only sees [`ExchangeGateway`]; the Coinbase binding lives
//! in [`coinbase`] and tests substitute an in-memory fake.

pub mod coinbase;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Money, OrderStatus, OscillatorSeries, ProductId, ProductIncrements, Side};

pub use coinbase::CoinbaseGateway;

/// Failures reported by a gateway after its own retries are exhausted
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The exchange has no order with this id
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// Order refused at submission
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("circuit breaker is open, rejecting request")]
    CircuitOpen,

    #[error("parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Worth another attempt inside the transport retry loop
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// A limit order to submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub product_id: ProductId,
    pub side: Side,
    pub price: Money,
    pub size: Money,
    /// Caller-chosen id used to find the order again after a crash
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn limit_buy(
        product_id: ProductId,
        price: Money,
        size: Money,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            side: Side::Buy,
            price,
            size,
            client_order_id: client_order_id.into(),
        }
    }

    pub fn limit_sell(
        product_id: ProductId,
        price: Money,
        size: Money,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            side: Side::Sell,
            price,
            size,
            client_order_id: client_order_id.into(),
        }
    }
}

/// Exchange view of one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    /// Average execution price, when anything executed
    pub fill_price: Option<Money>,
    /// Executed base quantity, when anything executed
    pub fill_size: Option<Money>,
}

impl OrderStatusReport {
    pub fn new(status: OrderStatus) -> Self {
        Self {
            status,
            fill_price: None,
            fill_size: None,
        }
    }

    pub fn with_fill(mut self, price: Money, size: Money) -> Self {
        self.fill_price = Some(price);
        self.fill_size = Some(size);
        self
    }

    /// Executed quantity, zero when nothing filled
    pub fn executed_size(&self) -> Money {
        self.fill_size.unwrap_or(Money::ZERO)
    }
}

/// A resting order as listed by the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub product_id: ProductId,
    pub side: Side,
    pub price: Money,
    pub size: Money,
    pub created_at: Option<DateTime<Utc>>,
}

/// What the trade manager needs from a venue.
///
/// Every call blocks until it has an answer or the implementation's own retry
/// policy gives up.
pub trait ExchangeGateway {
    /// RSI readings over recent candles, oldest first
    fn get_oscillator_history(&self, product_id: &ProductId, period: usize) -> ExchangeResult<OscillatorSeries>;

    fn get_reference_price(&self, product_id: &ProductId) -> ExchangeResult<Money>;

    fn get_product_increments(&self, product_id: &ProductId) -> ExchangeResult<ProductIncrements>;

    /// Submit a limit GTC order and return the exchange order id
    fn place_limit_order(&self, request: &OrderRequest) -> ExchangeResult<String>;

    /// `UnknownOrder` when the exchange has never heard of `order_id`
    fn get_order_status(&self, order_id: &str) -> ExchangeResult<OrderStatusReport>;

    fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;

    /// Order id of any order carrying this client id, whatever its status
    fn find_order_by_client_id(&self, product_id: &ProductId, client_order_id: &str) -> ExchangeResult<Option<String>>;

    /// Orders still resting on the book for a product
    fn list_open_orders(&self, product_id: &ProductId) -> ExchangeResult<Vec<OpenOrder>>;
}
