//! RSI Tier Bot
//!
//! Buys a configured quote amount when RSI climbs back out of oversold
//! territory, then sells the fill through a ladder of take-profit limit
//! orders. Each invocation runs one pass over every asset and exits; all
//! progress lives in per-asset state files so the next pass resumes exactly
//! where this one stopped.

pub mod common;
pub mod config;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod journal;
pub mod notify;
pub mod orders;
pub mod persistence;
pub mod runner;
pub mod signal;
pub mod state;
pub mod trade_manager;
pub mod types;

pub use config::{AssetConfig, Config, ExitTier};
pub use error::TradingError;
pub use exchange::{ExchangeError, ExchangeGateway};
pub use persistence::{PersistenceManager, StateStore};
pub use state::PersistedTradeState;
pub use trade_manager::{CycleOutcome, ManagerSettings, TradeManager};
pub use types::*;
