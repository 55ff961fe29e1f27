//! Trade lifecycle state machine
//!
//! One call to [`TradeManager::run_cycle`] loads an asset's durable state,
//! reconciles it against the exchange, takes at most one step of the
//! Idle -> BuyPending -> PositionOpen -> Idle lifecycle and persists the
//! result. Running it again before the exchange changes does nothing new.
//!
//! Exit orders are placed with a write-ahead intent: the record (status
//! `submitting`, deterministic client order id) is saved before the order is
//! sent. A crash between sending and recording the acknowledgement leaves the
//! intent behind; the next cycle looks the client id up on the exchange and
//! only resubmits if the exchange never saw it.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::AssetConfig;
use crate::error::TradingError;
use crate::exchange::{ExchangeError, ExchangeGateway, OrderRequest, OrderStatusReport};
use crate::notify::{Notifier, TradeEvent};
use crate::orders::{merge_undersized_tiers, size_entry_order, size_exit_orders};
use crate::persistence::StateStore;
use crate::signal::should_buy;
use crate::state::{
    entry_client_order_id, ExitOrderRecord, ExitOrderStatus, OpenPosition, PendingEntry,
    PersistedTradeState, ENTRY_CLIENT_ID_PREFIX,
};
use crate::types::{Money, OrderStatus, Side};

/// Knobs for policies the lifecycle leaves open
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Re-adopt an open entry BUY carrying our client id prefix when the
    /// asset is idle, instead of placing a second entry
    pub adopt_orphans: bool,
    /// Fold exit tiers that would be under the minimum order size into the
    /// last tier rather than refusing to plan the exits
    pub merge_undersized_tiers: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            adopt_orphans: true,
            merge_undersized_tiers: true,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Idle and the entry signal did not fire
    NoSignal,
    BuyPlaced { order_id: String },
    /// An untracked entry order was found on the exchange and is now tracked
    OrphanAdopted { order_id: String },
    /// Entry order still resting
    AwaitingFill,
    /// Entry timed out; cancellation requested, outcome seen next cycle
    EntryCancelRequested { order_id: String },
    /// Entry ended without any fill; back to idle
    EntryCancelled { order_id: String },
    /// Position still open after placing and refreshing exits
    PositionOpen { tiers: usize, placed: usize, filled: usize },
    /// Every exit finished; back to idle
    PositionClosed { entry_order_id: String },
    /// Persisted state referred to an order the exchange does not know
    StateReset { reason: String },
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::NoSignal => write!(f, "no signal"),
            CycleOutcome::BuyPlaced { order_id } => write!(f, "buy placed ({})", order_id),
            CycleOutcome::OrphanAdopted { order_id } => write!(f, "orphan adopted ({})", order_id),
            CycleOutcome::AwaitingFill => write!(f, "awaiting fill"),
            CycleOutcome::EntryCancelRequested { order_id } => {
                write!(f, "entry cancel requested ({})", order_id)
            }
            CycleOutcome::EntryCancelled { order_id } => write!(f, "entry cancelled ({})", order_id),
            CycleOutcome::PositionOpen { tiers, placed, filled } => {
                write!(f, "position open ({}/{} placed, {} filled)", placed, tiers, filled)
            }
            CycleOutcome::PositionClosed { entry_order_id } => {
                write!(f, "position closed ({})", entry_order_id)
            }
            CycleOutcome::StateReset { reason } => write!(f, "state reset: {}", reason),
        }
    }
}

pub struct TradeManager<'a> {
    store: &'a dyn StateStore,
    notifier: &'a dyn Notifier,
    settings: ManagerSettings,
}

impl<'a> TradeManager<'a> {
    pub fn new(store: &'a dyn StateStore, notifier: &'a dyn Notifier, settings: ManagerSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    /// Reconcile one asset and take at most one lifecycle step
    pub fn run_cycle(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
    ) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();
        let state = self.store.load(asset_id);
        debug!("[{}] Cycle start in {}", asset_id, state.phase());

        let result = match state {
            PersistedTradeState::Idle => self.step_idle(asset, exchange),
            PersistedTradeState::BuyPending(pending) => self.step_pending(asset, exchange, pending),
            PersistedTradeState::PositionOpen(position) => self.step_position(asset, exchange, position),
        };

        match result {
            Err(TradingError::InvariantViolation(reason)) => self.reset(asset, reason),
            Err(e) => {
                if matches!(e, TradingError::Exchange(_) | TradingError::Persistence(_)) {
                    self.notifier.notify(&TradeEvent::CycleError {
                        product_id: asset.product_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
            ok => ok,
        }
    }

    // =========================================================================
    // Idle
    // =========================================================================

    fn step_idle(&self, asset: &AssetConfig, exchange: &dyn ExchangeGateway) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();

        if self.settings.adopt_orphans {
            if let Some(outcome) = self.adopt_orphan(asset, exchange)? {
                return Ok(outcome);
            }
        }

        let series = exchange.get_oscillator_history(&asset.product_id, asset.rsi_period)?;
        let fire = should_buy(&series, asset.rsi_threshold)?;
        let readings = series.readings();
        info!(
            "[{}] RSI {:.2} (prev {:.2}) threshold {:.2}: {}",
            asset_id,
            readings[readings.len() - 1],
            readings[readings.len() - 2],
            asset.rsi_threshold,
            if fire { "BUY signal" } else { "no signal" }
        );
        if !fire {
            return Ok(CycleOutcome::NoSignal);
        }

        let reference_price = exchange.get_reference_price(&asset.product_id)?;
        let increments = exchange.get_product_increments(&asset.product_id)?;
        let entry = size_entry_order(asset.quote_spend, reference_price, &increments)?;

        let request = OrderRequest::limit_buy(
            asset.product_id.clone(),
            entry.price,
            entry.size,
            entry_client_order_id(),
        );
        let order_id = exchange.place_limit_order(&request)?;
        info!("[{}] Entry BUY {} @ {} placed as {}", asset_id, entry.size, entry.price, order_id);

        let pending = PendingEntry {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id,
            requested_price: entry.price,
            requested_size: entry.size,
            placed_at: Utc::now(),
        };
        self.store.save(asset_id, &PersistedTradeState::BuyPending(pending))?;

        self.notifier.notify(&TradeEvent::BuyPlaced {
            product_id: asset.product_id.clone(),
            order_id: order_id.clone(),
            price: entry.price,
            size: entry.size,
        });
        Ok(CycleOutcome::BuyPlaced { order_id })
    }

    fn adopt_orphan(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
    ) -> Result<Option<CycleOutcome>, TradingError> {
        let asset_id = asset.product_id.as_str();
        let orphan = exchange
            .list_open_orders(&asset.product_id)?
            .into_iter()
            .find(|o| o.side == Side::Buy && o.client_order_id.starts_with(ENTRY_CLIENT_ID_PREFIX));

        let Some(order) = orphan else {
            return Ok(None);
        };

        warn!(
            "[{}] Found untracked entry order {} ({}), adopting it",
            asset_id, order.order_id, order.client_order_id
        );
        let pending = PendingEntry {
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            requested_price: order.price,
            requested_size: order.size,
            placed_at: order.created_at.unwrap_or_else(Utc::now),
        };
        self.store.save(asset_id, &PersistedTradeState::BuyPending(pending))?;

        self.notifier.notify(&TradeEvent::OrphanAdopted {
            product_id: asset.product_id.clone(),
            order_id: order.order_id.clone(),
            client_order_id: order.client_order_id,
        });
        Ok(Some(CycleOutcome::OrphanAdopted {
            order_id: order.order_id,
        }))
    }

    // =========================================================================
    // BuyPending
    // =========================================================================

    fn step_pending(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        pending: PendingEntry,
    ) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();
        let report = order_status(exchange, &pending.order_id, "entry")?;
        debug!("[{}] Entry order {} is {}", asset_id, pending.order_id, report.status);

        match report.status {
            OrderStatus::Filled => {
                let (price, size) = fill_or_requested(asset_id, &report, &pending);
                self.open_position(asset, exchange, &pending, price, size)
            }
            OrderStatus::Open | OrderStatus::Pending => {
                if entry_timed_out(asset, pending.placed_at, Utc::now()) {
                    self.cancel_stale_entry(asset, exchange, &pending)
                } else {
                    Ok(CycleOutcome::AwaitingFill)
                }
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                if report.executed_size().is_positive() {
                    // Partial fill before the order died: the bought quantity still needs exits
                    let (price, size) = fill_or_requested(asset_id, &report, &pending);
                    warn!(
                        "[{}] Entry {} ended {} after partial fill of {}",
                        asset_id, pending.order_id, report.status, size
                    );
                    return self.open_position(asset, exchange, &pending, price, size);
                }

                info!("[{}] Entry {} ended {} without fill", asset_id, pending.order_id, report.status);
                self.store.save(asset_id, &PersistedTradeState::Idle)?;
                self.notifier.notify(&TradeEvent::BuyCancelled {
                    product_id: asset.product_id.clone(),
                    order_id: pending.order_id.clone(),
                    status: report.status,
                });
                Ok(CycleOutcome::EntryCancelled {
                    order_id: pending.order_id,
                })
            }
        }
    }

    fn cancel_stale_entry(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        pending: &PendingEntry,
    ) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();
        info!("[{}] Entry {} timed out, requesting cancel", asset_id, pending.order_id);
        match exchange.cancel_order(&pending.order_id) {
            Ok(()) => Ok(CycleOutcome::EntryCancelRequested {
                order_id: pending.order_id.clone(),
            }),
            Err(ExchangeError::UnknownOrder(id)) => Err(TradingError::InvariantViolation(format!(
                "entry order {} unknown to exchange on cancel",
                id
            ))),
            Err(ExchangeError::Rejected(reason)) => {
                // Usually filled in the meantime; next cycle sees it
                warn!("[{}] Cancel of {} refused: {}", asset_id, pending.order_id, reason);
                Ok(CycleOutcome::AwaitingFill)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Plan the exits from the actual fill and persist the open position
    /// before any exit is placed
    fn open_position(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        pending: &PendingEntry,
        fill_price: Money,
        fill_size: Money,
    ) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();
        let increments = exchange.get_product_increments(&asset.product_id)?;

        let tiers = if self.settings.merge_undersized_tiers {
            merge_undersized_tiers(fill_size, &asset.exit_tiers, &increments)
        } else {
            asset.exit_tiers.clone()
        };
        if tiers.len() < asset.exit_tiers.len() {
            warn!(
                "[{}] Fill of {} too small for {} tiers, using {}",
                asset_id,
                fill_size,
                asset.exit_tiers.len(),
                tiers.len()
            );
        }
        let plan = size_exit_orders(fill_price, fill_size, &tiers, &increments)?;

        let position = OpenPosition::new(pending.order_id.clone(), fill_price, fill_size, Utc::now(), &plan);
        self.store.save(asset_id, &PersistedTradeState::PositionOpen(position.clone()))?;
        info!("[{}] Entry filled {} @ {}, {} exits planned", asset_id, fill_size, fill_price, plan.len());

        self.notifier.notify(&TradeEvent::BuyFilled {
            product_id: asset.product_id.clone(),
            order_id: pending.order_id.clone(),
            fill_price,
            fill_size,
        });

        self.step_position(asset, exchange, position)
    }

    // =========================================================================
    // PositionOpen
    // =========================================================================

    fn step_position(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        mut position: OpenPosition,
    ) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();

        // Intents left by an interrupted earlier cycle
        let stranded: Vec<usize> = position
            .exit_orders
            .iter()
            .filter(|o| o.status == ExitOrderStatus::Submitting)
            .map(|o| o.tier_index)
            .collect();
        for tier_index in stranded {
            self.resolve_intent(asset, exchange, &mut position, tier_index)?;
        }

        // Tiers never attempted
        while let Some(plan) = position.next_unplaced() {
            position
                .exit_orders
                .push(ExitOrderRecord::intent(&position.entry_order_id, &plan));
            self.save_position(asset_id, &position)?;
            self.submit_exit(asset, exchange, &mut position, plan.tier_index)?;
        }

        self.refresh_exits(asset, exchange, &mut position)?;

        if position.is_complete() {
            return self.close_position(asset, position);
        }

        let filled = position
            .exit_orders
            .iter()
            .filter(|o| o.status == ExitOrderStatus::Filled)
            .count();
        Ok(CycleOutcome::PositionOpen {
            tiers: position.exit_plan.len(),
            placed: position.exit_orders.len(),
            filled,
        })
    }

    fn resolve_intent(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        position: &mut OpenPosition,
        tier_index: usize,
    ) -> Result<(), TradingError> {
        let asset_id = asset.product_id.as_str();
        let client_order_id = match position.exit_for_tier_mut(tier_index) {
            Some(record) => record.client_order_id.clone(),
            None => return Ok(()),
        };

        match exchange.find_order_by_client_id(&asset.product_id, &client_order_id)? {
            Some(order_id) => {
                info!(
                    "[{}] Tier {} exit {} already on exchange as {}",
                    asset_id, tier_index, client_order_id, order_id
                );
                self.acknowledge_exit(asset, position, tier_index, order_id)
            }
            None => {
                info!("[{}] Tier {} exit never reached exchange, resubmitting", asset_id, tier_index);
                self.submit_exit(asset, exchange, position, tier_index)
            }
        }
    }

    fn submit_exit(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        position: &mut OpenPosition,
        tier_index: usize,
    ) -> Result<(), TradingError> {
        let asset_id = asset.product_id.as_str();
        let request = match position.exit_for_tier_mut(tier_index) {
            Some(record) => OrderRequest::limit_sell(
                asset.product_id.clone(),
                record.price,
                record.size,
                record.client_order_id.clone(),
            ),
            None => return Ok(()),
        };

        match exchange.place_limit_order(&request) {
            Ok(order_id) => self.acknowledge_exit(asset, position, tier_index, order_id),
            Err(ExchangeError::Rejected(reason)) => {
                error!(
                    "[{}] Tier {} SELL {} @ {} rejected: {}",
                    asset_id, tier_index, request.size, request.price, reason
                );
                if let Some(record) = position.exit_for_tier_mut(tier_index) {
                    record.status = ExitOrderStatus::Rejected;
                }
                self.save_position(asset_id, position)?;
                self.notifier.notify(&TradeEvent::CycleError {
                    product_id: asset.product_id.clone(),
                    error: format!("tier {} exit rejected: {}", tier_index, reason),
                });
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn acknowledge_exit(
        &self,
        asset: &AssetConfig,
        position: &mut OpenPosition,
        tier_index: usize,
        order_id: String,
    ) -> Result<(), TradingError> {
        let asset_id = asset.product_id.as_str();
        let (price, size) = match position.exit_for_tier_mut(tier_index) {
            Some(record) => {
                record.order_id = Some(order_id.clone());
                record.status = ExitOrderStatus::Open;
                (record.price, record.size)
            }
            None => return Ok(()),
        };
        self.save_position(asset_id, position)?;
        info!("[{}] Tier {} SELL {} @ {} placed as {}", asset_id, tier_index, size, price, order_id);

        self.notifier.notify(&TradeEvent::ExitPlaced {
            product_id: asset.product_id.clone(),
            tier_index,
            order_id,
            price,
            size,
        });
        Ok(())
    }

    fn refresh_exits(
        &self,
        asset: &AssetConfig,
        exchange: &dyn ExchangeGateway,
        position: &mut OpenPosition,
    ) -> Result<(), TradingError> {
        let asset_id = asset.product_id.as_str();

        for i in 0..position.exit_orders.len() {
            let record = &position.exit_orders[i];
            let order_id = match (&record.order_id, record.status.is_terminal()) {
                (Some(id), false) => id.clone(),
                _ => continue,
            };

            let report = order_status(exchange, &order_id, "exit")?;
            let status = ExitOrderStatus::from(report.status);

            let record = &mut position.exit_orders[i];
            if status == record.status && report.fill_size == record.filled_size {
                continue;
            }
            record.status = status;
            record.filled_size = report.fill_size;
            record.fill_price = report.fill_price;
            let (tier_index, price, size) = (record.tier_index, record.fill_price.unwrap_or(record.price), record.size);
            self.save_position(asset_id, position)?;

            match status {
                ExitOrderStatus::Filled => {
                    info!("[{}] Tier {} SELL {} filled @ {}", asset_id, tier_index, size, price);
                    self.notifier.notify(&TradeEvent::ExitFilled {
                        product_id: asset.product_id.clone(),
                        tier_index,
                        order_id,
                        price,
                        size,
                    });
                }
                s if s.is_terminal() => {
                    warn!("[{}] Tier {} exit {} ended {}", asset_id, tier_index, order_id, s);
                }
                _ => debug!("[{}] Tier {} exit {} now {}", asset_id, tier_index, order_id, status),
            }
        }
        Ok(())
    }

    fn close_position(&self, asset: &AssetConfig, position: OpenPosition) -> Result<CycleOutcome, TradingError> {
        let asset_id = asset.product_id.as_str();
        self.store.save(asset_id, &PersistedTradeState::Idle)?;

        let sold = position.sold_size();
        if sold < position.fill_size {
            warn!(
                "[{}] Position closed with {} of {} sold; remainder left in account",
                asset_id, sold, position.fill_size
            );
        }
        info!("[{}] Round trip complete for entry {}", asset_id, position.entry_order_id);

        self.notifier.notify(&TradeEvent::PositionClosed {
            product_id: asset.product_id.clone(),
            entry_order_id: position.entry_order_id.clone(),
            filled_at: position.filled_at,
            fill_price: position.fill_price,
            fill_size: position.fill_size,
            sold_size: sold,
            cost_basis: position.cost_basis(),
            proceeds: position.proceeds(),
        });
        Ok(CycleOutcome::PositionClosed {
            entry_order_id: position.entry_order_id,
        })
    }

    fn save_position(&self, asset_id: &str, position: &OpenPosition) -> Result<(), TradingError> {
        self.store
            .save(asset_id, &PersistedTradeState::PositionOpen(position.clone()))
    }

    /// Drop a record the exchange no longer recognises
    fn reset(&self, asset: &AssetConfig, reason: String) -> Result<CycleOutcome, TradingError> {
        error!("[{}] {}; resetting to idle", asset.product_id, reason);
        self.store.save(asset.product_id.as_str(), &PersistedTradeState::Idle)?;
        self.notifier.notify(&TradeEvent::StateReset {
            product_id: asset.product_id.clone(),
            reason: reason.clone(),
        });
        Ok(CycleOutcome::StateReset { reason })
    }
}

/// Status lookup that turns an unknown id into an invariant violation
fn order_status(exchange: &dyn ExchangeGateway, order_id: &str, role: &str) -> Result<OrderStatusReport, TradingError> {
    match exchange.get_order_status(order_id) {
        Ok(report) => Ok(report),
        Err(ExchangeError::UnknownOrder(_)) => Err(TradingError::InvariantViolation(format!(
            "{} order {} unknown to exchange",
            role, order_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Exchange-reported fill, falling back to what was requested when the
/// exchange leaves the fill fields empty
fn fill_or_requested(asset_id: &str, report: &OrderStatusReport, pending: &PendingEntry) -> (Money, Money) {
    match (report.fill_price, report.fill_size) {
        (Some(price), Some(size)) if size.is_positive() => (price, size),
        _ => {
            warn!(
                "[{}] No fill details for {}, using requested {} @ {}",
                asset_id, pending.order_id, pending.requested_size, pending.requested_price
            );
            (pending.requested_price, pending.requested_size)
        }
    }
}

fn entry_timed_out(asset: &AssetConfig, placed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match asset.entry_timeout_minutes {
        Some(minutes) => now - placed_at >= Duration::minutes(minutes),
        None => false,
    }
}
