//! Per-asset trade lifecycle state
//!
//! One value of [`PersistedTradeState`] per asset is the only memory the bot
//! has between invocations. The enum makes a pending entry and an open
//! position mutually exclusive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Money, OrderParams, OrderStatus};

/// Client order id prefix for every order this bot places
pub const CLIENT_ID_PREFIX: &str = "rsibot-";

/// Entry orders carry `rsibot-entry-<uuid>`
pub const ENTRY_CLIENT_ID_PREFIX: &str = "rsibot-entry-";

/// Fresh client order id for an entry BUY
pub fn entry_client_order_id() -> String {
    format!("{}{}", ENTRY_CLIENT_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Deterministic client order id for an exit tier.
///
/// Derived from the entry order so a retried submission after a crash reuses
/// the same id and can be found on the exchange.
pub fn exit_client_order_id(entry_order_id: &str, tier_index: usize) -> String {
    format!("{}exit-{}-{}", CLIENT_ID_PREFIX, entry_order_id, tier_index)
}

/// Durable state of one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PersistedTradeState {
    /// No open position and no pending entry
    #[default]
    Idle,
    /// Entry BUY submitted, fill not yet confirmed
    BuyPending(PendingEntry),
    /// Entry filled; exit tiers being placed or tracked
    PositionOpen(OpenPosition),
}

impl PersistedTradeState {
    pub fn phase(&self) -> &'static str {
        match self {
            PersistedTradeState::Idle => "idle",
            PersistedTradeState::BuyPending(_) => "buy_pending",
            PersistedTradeState::PositionOpen(_) => "position_open",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, PersistedTradeState::Idle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub order_id: String,
    pub client_order_id: String,
    pub requested_price: Money,
    pub requested_size: Money,
    pub placed_at: DateTime<Utc>,
}

/// One planned exit, fixed at fill time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedExit {
    pub tier_index: usize,
    pub price: Money,
    pub size: Money,
}

/// Lifecycle of one exit order as recorded locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOrderStatus {
    /// Intent written, exchange acknowledgement not yet recorded
    Submitting,
    Open,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl ExitOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExitOrderStatus::Filled
                | ExitOrderStatus::Cancelled
                | ExitOrderStatus::Rejected
                | ExitOrderStatus::Expired
        )
    }
}

impl From<OrderStatus> for ExitOrderStatus {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Pending | OrderStatus::Open => ExitOrderStatus::Open,
            OrderStatus::Filled => ExitOrderStatus::Filled,
            OrderStatus::Cancelled => ExitOrderStatus::Cancelled,
            OrderStatus::Rejected => ExitOrderStatus::Rejected,
            OrderStatus::Expired => ExitOrderStatus::Expired,
        }
    }
}

impl std::fmt::Display for ExitOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitOrderStatus::Submitting => "submitting",
            ExitOrderStatus::Open => "open",
            ExitOrderStatus::Filled => "filled",
            ExitOrderStatus::Cancelled => "cancelled",
            ExitOrderStatus::Rejected => "rejected",
            ExitOrderStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOrderRecord {
    pub tier_index: usize,
    pub client_order_id: String,
    /// Set once the exchange has acknowledged the order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub price: Money,
    pub size: Money,
    pub status: ExitOrderStatus,
    /// Quantity the exchange reports as executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_size: Option<Money>,
    /// Average execution price reported by the exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<Money>,
}

impl ExitOrderRecord {
    /// Intent record written before the exchange sees the order
    pub fn intent(entry_order_id: &str, plan: &PlannedExit) -> Self {
        ExitOrderRecord {
            tier_index: plan.tier_index,
            client_order_id: exit_client_order_id(entry_order_id, plan.tier_index),
            order_id: None,
            price: plan.price,
            size: plan.size,
            status: ExitOrderStatus::Submitting,
            filled_size: None,
            fill_price: None,
        }
    }

    /// Quote proceeds of whatever part of this exit executed
    pub fn proceeds(&self) -> Money {
        let size = self.filled_size.unwrap_or(match self.status {
            ExitOrderStatus::Filled => self.size,
            _ => Money::ZERO,
        });
        size * self.fill_price.unwrap_or(self.price)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub entry_order_id: String,
    pub fill_price: Money,
    pub fill_size: Money,
    pub filled_at: DateTime<Utc>,
    pub exit_plan: Vec<PlannedExit>,
    #[serde(default)]
    pub exit_orders: Vec<ExitOrderRecord>,
}

impl OpenPosition {
    pub fn new(
        entry_order_id: impl Into<String>,
        fill_price: Money,
        fill_size: Money,
        filled_at: DateTime<Utc>,
        plan: &[OrderParams],
    ) -> Self {
        OpenPosition {
            entry_order_id: entry_order_id.into(),
            fill_price,
            fill_size,
            filled_at,
            exit_plan: plan
                .iter()
                .enumerate()
                .map(|(tier_index, p)| PlannedExit {
                    tier_index,
                    price: p.price,
                    size: p.size,
                })
                .collect(),
            exit_orders: Vec::new(),
        }
    }

    /// First planned tier with no exit record yet
    pub fn next_unplaced(&self) -> Option<PlannedExit> {
        self.exit_plan
            .iter()
            .find(|p| !self.exit_orders.iter().any(|o| o.tier_index == p.tier_index))
            .copied()
    }

    pub fn exit_for_tier_mut(&mut self, tier_index: usize) -> Option<&mut ExitOrderRecord> {
        self.exit_orders.iter_mut().find(|o| o.tier_index == tier_index)
    }

    /// Every tier placed and every exit order finished
    pub fn is_complete(&self) -> bool {
        self.next_unplaced().is_none() && self.exit_orders.iter().all(|o| o.status.is_terminal())
    }

    pub fn cost_basis(&self) -> Money {
        self.fill_price * self.fill_size
    }

    pub fn proceeds(&self) -> Money {
        self.exit_orders.iter().map(ExitOrderRecord::proceeds).sum()
    }

    pub fn sold_size(&self) -> Money {
        self.exit_orders
            .iter()
            .map(|o| match (o.filled_size, o.status) {
                (Some(s), _) => s,
                (None, ExitOrderStatus::Filled) => o.size,
                _ => Money::ZERO,
            })
            .sum()
    }
}
