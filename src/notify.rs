//! Trade event notifications
//!
//! The trade manager reports every transition through [`Notifier`]. Delivery
//! is best effort: a notifier logs its own failures and never returns them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::types::{Money, OrderStatus, ProductId};

/// One state transition worth telling someone about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    BuyPlaced {
        product_id: ProductId,
        order_id: String,
        price: Money,
        size: Money,
    },
    BuyFilled {
        product_id: ProductId,
        order_id: String,
        fill_price: Money,
        fill_size: Money,
    },
    BuyCancelled {
        product_id: ProductId,
        order_id: String,
        status: OrderStatus,
    },
    ExitPlaced {
        product_id: ProductId,
        tier_index: usize,
        order_id: String,
        price: Money,
        size: Money,
    },
    ExitFilled {
        product_id: ProductId,
        tier_index: usize,
        order_id: String,
        price: Money,
        size: Money,
    },
    PositionClosed {
        product_id: ProductId,
        entry_order_id: String,
        filled_at: DateTime<Utc>,
        fill_price: Money,
        fill_size: Money,
        sold_size: Money,
        cost_basis: Money,
        proceeds: Money,
    },
    OrphanAdopted {
        product_id: ProductId,
        order_id: String,
        client_order_id: String,
    },
    StateReset {
        product_id: ProductId,
        reason: String,
    },
    CycleError {
        product_id: ProductId,
        error: String,
    },
}

impl TradeEvent {
    pub fn product_id(&self) -> &ProductId {
        match self {
            TradeEvent::BuyPlaced { product_id, .. }
            | TradeEvent::BuyFilled { product_id, .. }
            | TradeEvent::BuyCancelled { product_id, .. }
            | TradeEvent::ExitPlaced { product_id, .. }
            | TradeEvent::ExitFilled { product_id, .. }
            | TradeEvent::PositionClosed { product_id, .. }
            | TradeEvent::OrphanAdopted { product_id, .. }
            | TradeEvent::StateReset { product_id, .. }
            | TradeEvent::CycleError { product_id, .. } => product_id,
        }
    }

    /// Snake-case event name, matching the JSON tag
    pub fn kind(&self) -> &'static str {
        match self {
            TradeEvent::BuyPlaced { .. } => "buy_placed",
            TradeEvent::BuyFilled { .. } => "buy_filled",
            TradeEvent::BuyCancelled { .. } => "buy_cancelled",
            TradeEvent::ExitPlaced { .. } => "exit_placed",
            TradeEvent::ExitFilled { .. } => "exit_filled",
            TradeEvent::PositionClosed { .. } => "position_closed",
            TradeEvent::OrphanAdopted { .. } => "orphan_adopted",
            TradeEvent::StateReset { .. } => "state_reset",
            TradeEvent::CycleError { .. } => "cycle_error",
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self {
            TradeEvent::BuyPlaced { order_id, price, size, .. } => {
                format!("BUY {} @ {} placed (order {})", size, price, order_id)
            }
            TradeEvent::BuyFilled { fill_price, fill_size, .. } => {
                format!("BUY filled {} @ {}", fill_size, fill_price)
            }
            TradeEvent::BuyCancelled { order_id, status, .. } => {
                format!("BUY order {} ended {} without fill", order_id, status)
            }
            TradeEvent::ExitPlaced { tier_index, price, size, .. } => {
                format!("SELL tier {} {} @ {} placed", tier_index, size, price)
            }
            TradeEvent::ExitFilled { tier_index, price, size, .. } => {
                format!("SELL tier {} filled {} @ {}", tier_index, size, price)
            }
            TradeEvent::PositionClosed { cost_basis, proceeds, .. } => {
                format!("Position closed: cost {} proceeds {} P&L {}", cost_basis, proceeds, *proceeds - *cost_basis)
            }
            TradeEvent::OrphanAdopted { order_id, .. } => {
                format!("Adopted untracked BUY order {}", order_id)
            }
            TradeEvent::StateReset { reason, .. } => format!("State reset to idle: {}", reason),
            TradeEvent::CycleError { error, .. } => format!("Cycle failed: {}", error),
        }
    }
}

/// Side-effecting sink for trade events
pub trait Notifier {
    fn notify(&self, event: &TradeEvent);
}

/// Writes events to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &TradeEvent) {
        match event {
            TradeEvent::CycleError { .. } | TradeEvent::StateReset { .. } => {
                error!("[{}] {}", event.product_id(), event.summary())
            }
            TradeEvent::OrphanAdopted { .. } => warn!("[{}] {}", event.product_id(), event.summary()),
            _ => info!("[{}] {}", event.product_id(), event.summary()),
        }
    }
}

/// POSTs each event as JSON to a fixed URL
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: &TradeEvent) {
        let result = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!("[{}] Webhook delivery of {} failed: {}", event.product_id(), event.kind(), e);
        }
    }
}

/// Forwards every event to each inner notifier in order
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Notifier + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: &TradeEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}
