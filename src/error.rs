//! Error types for the trading cycle

use thiserror::Error;

use crate::exchange::ExchangeError;

/// Errors raised while running one asset's trading cycle.
///
/// Every variant is scoped to a single asset: the runner logs it and moves on
/// to the next configured product.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Fewer oscillator readings than the signal lookback needs
    #[error("insufficient data: need at least {required} readings, got {available}")]
    InsufficientData { required: usize, available: usize },

    /// Computed order size is zero or below the exchange minimum
    #[error("order too small: {0}")]
    OrderTooSmall(String),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// I/O or encoding failure while saving durable state
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Persisted state refers to something the exchange does not recognise
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for TradingError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
