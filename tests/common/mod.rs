//! Shared fakes for the trade cycle integration tests

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rsi_tier_bot::exchange::{ExchangeError, ExchangeGateway, ExchangeResult, OpenOrder, OrderRequest, OrderStatusReport};
use rsi_tier_bot::notify::{Notifier, TradeEvent};
use rsi_tier_bot::persistence::{PersistenceManager, StateStore};
use rsi_tier_bot::state::PersistedTradeState;
use rsi_tier_bot::{Money, OrderStatus, OscillatorSeries, ProductId, ProductIncrements, TradingError};
use rust_decimal_macros::dec;

pub const PRODUCT: &str = "BTC-USD";

/// Oversold dip and recovery through 30
pub const BUY_SERIES: [f64; 5] = [50.0, 42.0, 25.0, 29.0, 31.0];

/// Drifting lower, never crosses
pub const FLAT_SERIES: [f64; 5] = [50.0, 45.0, 40.0, 35.0, 33.0];

// =============================================================================
// Fake exchange
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeOrder {
    pub order_id: String,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub fill_price: Option<Money>,
    pub fill_size: Option<Money>,
}

/// In-memory exchange: orders rest as `Open` until a test moves them
pub struct FakeGateway {
    pub series: RefCell<Vec<f64>>,
    pub price: Cell<Money>,
    pub increments: ProductIncrements,
    orders: RefCell<Vec<FakeOrder>>,
    placements: RefCell<HashMap<String, usize>>,
    next_id: Cell<u64>,
    /// Every placement fails with a transport error while set
    pub fail_placements: Cell<bool>,
    /// Placements that succeed before the rest fail; `None` is unlimited
    pub placement_budget: Cell<Option<usize>>,
    /// Every status lookup fails with a transport error while set
    pub fail_status: Cell<bool>,
    rejected_client_ids: RefCell<HashSet<String>>,
    pub cancel_calls: Cell<usize>,
}

impl FakeGateway {
    pub fn new(series: &[f64]) -> Self {
        Self {
            series: RefCell::new(series.to_vec()),
            price: Cell::new(Money::from(dec!(100))),
            increments: ProductIncrements {
                price_increment: Money::from(dec!(0.01)),
                base_increment: Money::from(dec!(0.0001)),
                min_order_size: Money::from(dec!(0.0001)),
            },
            orders: RefCell::new(Vec::new()),
            placements: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            fail_placements: Cell::new(false),
            placement_budget: Cell::new(None),
            fail_status: Cell::new(false),
            rejected_client_ids: RefCell::new(HashSet::new()),
            cancel_calls: Cell::new(0),
        }
    }

    pub fn set_series(&self, series: &[f64]) {
        *self.series.borrow_mut() = series.to_vec();
    }

    pub fn orders(&self) -> Vec<FakeOrder> {
        self.orders.borrow().clone()
    }

    pub fn order(&self, order_id: &str) -> Option<FakeOrder> {
        self.orders.borrow().iter().find(|o| o.order_id == order_id).cloned()
    }

    pub fn sells(&self) -> Vec<FakeOrder> {
        self.orders
            .borrow()
            .iter()
            .filter(|o| o.request.side == rsi_tier_bot::Side::Sell)
            .cloned()
            .collect()
    }

    pub fn total_placements(&self) -> usize {
        self.placements.borrow().values().sum()
    }

    /// Times a given client order id was submitted
    pub fn placements_for(&self, client_order_id: &str) -> usize {
        self.placements.borrow().get(client_order_id).copied().unwrap_or(0)
    }

    pub fn max_placements_per_client_id(&self) -> usize {
        self.placements.borrow().values().copied().max().unwrap_or(0)
    }

    /// Refuse any order submitted with this client id
    pub fn reject_client_id(&self, client_order_id: &str) {
        self.rejected_client_ids
            .borrow_mut()
            .insert(client_order_id.to_string());
    }

    /// Mark an order fully filled at its limit price
    pub fn fill(&self, order_id: &str) {
        self.update(order_id, |o| {
            o.status = OrderStatus::Filled;
            o.fill_price = Some(o.request.price);
            o.fill_size = Some(o.request.size);
        });
    }

    /// Partially fill an order and leave it in `status`
    pub fn fill_partial(&self, order_id: &str, size: Money, status: OrderStatus) {
        self.update(order_id, |o| {
            o.status = status;
            o.fill_price = Some(o.request.price);
            o.fill_size = Some(size);
        });
    }

    pub fn set_status(&self, order_id: &str, status: OrderStatus) {
        self.update(order_id, |o| o.status = status);
    }

    /// Drop an order so the exchange no longer recognises its id
    pub fn forget(&self, order_id: &str) {
        self.orders.borrow_mut().retain(|o| o.order_id != order_id);
    }

    /// Insert a resting order the bot has no record of
    pub fn seed_open_order(&self, request: OrderRequest) -> String {
        let order_id = self.allocate_id();
        self.orders.borrow_mut().push(FakeOrder {
            order_id: order_id.clone(),
            request,
            status: OrderStatus::Open,
            fill_price: None,
            fill_size: None,
        });
        order_id
    }

    fn update(&self, order_id: &str, f: impl FnOnce(&mut FakeOrder)) {
        let mut orders = self.orders.borrow_mut();
        let order = orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .unwrap_or_else(|| panic!("no fake order {}", order_id));
        f(order);
    }

    fn allocate_id(&self) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        format!("ord-{}", id)
    }
}

impl ExchangeGateway for FakeGateway {
    fn get_oscillator_history(&self, _product_id: &ProductId, _period: usize) -> ExchangeResult<OscillatorSeries> {
        Ok(OscillatorSeries::new(self.series.borrow().clone()))
    }

    fn get_reference_price(&self, _product_id: &ProductId) -> ExchangeResult<Money> {
        Ok(self.price.get())
    }

    fn get_product_increments(&self, _product_id: &ProductId) -> ExchangeResult<ProductIncrements> {
        Ok(self.increments)
    }

    fn place_limit_order(&self, request: &OrderRequest) -> ExchangeResult<String> {
        if self.fail_placements.get() {
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }
        match self.placement_budget.get() {
            Some(0) => return Err(ExchangeError::Transport("connection reset".to_string())),
            Some(left) => self.placement_budget.set(Some(left - 1)),
            None => {}
        }
        if self.rejected_client_ids.borrow().contains(&request.client_order_id) {
            return Err(ExchangeError::Rejected("INSUFFICIENT_FUND".to_string()));
        }
        *self
            .placements
            .borrow_mut()
            .entry(request.client_order_id.clone())
            .or_insert(0) += 1;
        Ok(self.seed_open_order(request.clone()))
    }

    fn get_order_status(&self, order_id: &str) -> ExchangeResult<OrderStatusReport> {
        if self.fail_status.get() {
            return Err(ExchangeError::Transport("timeout".to_string()));
        }
        let order = self
            .order(order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(order_id.to_string()))?;
        let mut report = OrderStatusReport::new(order.status);
        if let (Some(price), Some(size)) = (order.fill_price, order.fill_size) {
            report = report.with_fill(price, size);
        }
        Ok(report)
    }

    fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        self.cancel_calls.set(self.cancel_calls.get() + 1);
        let order = self
            .order(order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(ExchangeError::Rejected(format!("order already {}", order.status)));
        }
        self.set_status(order_id, OrderStatus::Cancelled);
        Ok(())
    }

    fn find_order_by_client_id(&self, product_id: &ProductId, client_order_id: &str) -> ExchangeResult<Option<String>> {
        Ok(self
            .orders
            .borrow()
            .iter()
            .find(|o| &o.request.product_id == product_id && o.request.client_order_id == client_order_id)
            .map(|o| o.order_id.clone()))
    }

    fn list_open_orders(&self, product_id: &ProductId) -> ExchangeResult<Vec<OpenOrder>> {
        Ok(self
            .orders
            .borrow()
            .iter()
            .filter(|o| &o.request.product_id == product_id && o.status == OrderStatus::Open)
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                client_order_id: o.request.client_order_id.clone(),
                product_id: o.request.product_id.clone(),
                side: o.request.side,
                price: o.request.price,
                size: o.request.size,
                created_at: Some(Utc::now()),
            })
            .collect())
    }
}

// =============================================================================
// Store with injected failures
// =============================================================================

/// File store that fails exactly one chosen save (1-based)
pub struct FailingStore {
    pub inner: PersistenceManager,
    saves: Cell<usize>,
    fail_on: Cell<Option<usize>>,
}

impl FailingStore {
    pub fn new(inner: PersistenceManager) -> Self {
        Self {
            inner,
            saves: Cell::new(0),
            fail_on: Cell::new(None),
        }
    }

    /// Fail the `n`th save counted from now
    pub fn fail_nth_save(&self, n: usize) {
        self.fail_on.set(Some(self.saves.get() + n));
    }

    pub fn saves(&self) -> usize {
        self.saves.get()
    }
}

impl StateStore for FailingStore {
    fn load(&self, asset_id: &str) -> PersistedTradeState {
        self.inner.load(asset_id)
    }

    fn save(&self, asset_id: &str, state: &PersistedTradeState) -> Result<(), TradingError> {
        let n = self.saves.get() + 1;
        self.saves.set(n);
        if self.fail_on.get() == Some(n) {
            return Err(TradingError::Persistence("injected save failure".to_string()));
        }
        self.inner.save(asset_id, state)
    }
}

// =============================================================================
// Notifier
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: RefCell<Vec<TradeEvent>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(TradeEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &TradeEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}
