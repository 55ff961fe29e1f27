//! Integration tests for the trade lifecycle
//!
//! Drive `TradeManager::run_cycle` against an in-memory exchange and a real
//! state directory, one simulated process invocation per call.

mod common;

use std::fs;

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use common::*;
use rsi_tier_bot::exchange::OrderRequest;
use rsi_tier_bot::journal::TradeJournal;
use rsi_tier_bot::notify::{Notifier, TradeEvent};
use rsi_tier_bot::runner::run_pass;
use rsi_tier_bot::state::{
    entry_client_order_id, exit_client_order_id, ExitOrderRecord, ExitOrderStatus, OpenPosition, PendingEntry,
};
use rsi_tier_bot::{
    AssetConfig, CycleOutcome, ExchangeError, ExitTier, ManagerSettings, Money, OrderParams, OrderStatus,
    PersistedTradeState, PersistenceManager, ProductId, StateStore, TradeManager, TradingError,
};

// =============================================================================
// Test Utilities
// =============================================================================

struct Harness {
    _dir: tempfile::TempDir,
    store: FailingStore,
    notifier: RecordingNotifier,
    gateway: FakeGateway,
    asset: AssetConfig,
}

impl Harness {
    fn new(series: &[f64]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = FailingStore::new(PersistenceManager::new(dir.path()).unwrap());
        Self {
            _dir: dir,
            store,
            notifier: RecordingNotifier::default(),
            gateway: FakeGateway::new(series),
            asset: AssetConfig::new(PRODUCT, Money::from(dec!(30))),
        }
    }

    fn cycle(&self) -> Result<CycleOutcome, TradingError> {
        self.cycle_with(&self.notifier)
    }

    fn cycle_with(&self, notifier: &dyn Notifier) -> Result<CycleOutcome, TradingError> {
        let manager = TradeManager::new(&self.store, notifier, ManagerSettings::default());
        manager.run_cycle(&self.asset, &self.gateway)
    }

    fn state(&self) -> PersistedTradeState {
        self.store.load(PRODUCT)
    }

    fn pending(&self) -> PendingEntry {
        match self.state() {
            PersistedTradeState::BuyPending(p) => p,
            other => panic!("expected buy_pending, got {:?}", other),
        }
    }

    fn position(&self) -> OpenPosition {
        match self.state() {
            PersistedTradeState::PositionOpen(p) => p,
            other => panic!("expected position_open, got {:?}", other),
        }
    }

    /// Place the entry and fill it; leaves the position with exits placed
    fn open_position(&self) -> OpenPosition {
        assert!(matches!(self.cycle().unwrap(), CycleOutcome::BuyPlaced { .. }));
        self.gateway.fill(&self.pending().order_id);
        self.cycle().unwrap();
        self.position()
    }

    fn state_bytes(&self) -> Vec<u8> {
        fs::read(self.store.inner.path_for(PRODUCT)).unwrap()
    }
}

fn money(d: rust_decimal::Decimal) -> Money {
    Money::from(d)
}

// =============================================================================
// Idle
// =============================================================================

#[test]
fn test_no_signal_stays_idle_without_writing() {
    let h = Harness::new(&FLAT_SERIES);
    assert_eq!(h.cycle().unwrap(), CycleOutcome::NoSignal);
    assert!(h.state().is_idle());
    assert_eq!(h.store.saves(), 0);
    assert_eq!(h.gateway.total_placements(), 0);
}

#[test]
fn test_insufficient_data_is_reported() {
    let h = Harness::new(&[31.0, 29.0]);
    let err = h.cycle().unwrap_err();
    assert!(matches!(err, TradingError::InsufficientData { required: 4, available: 2 }));
    assert!(h.state().is_idle());
}

#[test]
fn test_signal_places_entry_and_persists_pending() {
    let h = Harness::new(&BUY_SERIES);
    let outcome = h.cycle().unwrap();

    let orders = h.gateway.orders();
    assert_eq!(orders.len(), 1);
    let entry = &orders[0];
    assert_eq!(outcome, CycleOutcome::BuyPlaced { order_id: entry.order_id.clone() });
    assert_eq!(entry.request.side, rsi_tier_bot::Side::Buy);
    assert_eq!(entry.request.price, money(dec!(100)));
    assert_eq!(entry.request.size, money(dec!(0.3)));
    assert!(entry.request.client_order_id.starts_with("rsibot-entry-"));

    let pending = h.pending();
    assert_eq!(pending.order_id, entry.order_id);
    assert_eq!(pending.client_order_id, entry.request.client_order_id);
    assert_eq!(h.notifier.kinds(), vec!["buy_placed"]);
}

#[test]
fn test_entry_submission_failure_stays_idle() {
    let h = Harness::new(&BUY_SERIES);
    h.gateway.fail_placements.set(true);

    let err = h.cycle().unwrap_err();
    assert!(matches!(err, TradingError::Exchange(ExchangeError::Transport(_))));
    assert!(h.store.inner.load_record(PRODUCT).unwrap().is_none());
    assert_eq!(h.notifier.kinds(), vec!["cycle_error"]);
}

#[test]
fn test_entry_too_small_is_skipped() {
    let mut h = Harness::new(&BUY_SERIES);
    h.asset.quote_spend = money(dec!(0.001));

    assert!(matches!(h.cycle(), Err(TradingError::OrderTooSmall(_))));
    assert_eq!(h.gateway.total_placements(), 0);
    assert!(h.state().is_idle());
}

#[test]
fn test_orphan_entry_is_adopted_instead_of_placing_another() {
    let h = Harness::new(&BUY_SERIES);
    let client_id = entry_client_order_id();
    let orphan = h.gateway.seed_open_order(OrderRequest::limit_buy(
        ProductId::new(PRODUCT),
        money(dec!(99.5)),
        money(dec!(0.2)),
        client_id.clone(),
    ));

    assert_eq!(h.cycle().unwrap(), CycleOutcome::OrphanAdopted { order_id: orphan.clone() });
    assert_eq!(h.gateway.total_placements(), 0);

    let pending = h.pending();
    assert_eq!(pending.order_id, orphan);
    assert_eq!(pending.client_order_id, client_id);
    assert_eq!(pending.requested_price, money(dec!(99.5)));
    assert_eq!(h.notifier.count("orphan_adopted"), 1);
}

#[test]
fn test_foreign_open_orders_are_not_adopted() {
    let h = Harness::new(&BUY_SERIES);
    h.gateway.seed_open_order(OrderRequest::limit_buy(
        ProductId::new(PRODUCT),
        money(dec!(90)),
        money(dec!(1)),
        "manual-order-1",
    ));

    assert!(matches!(h.cycle().unwrap(), CycleOutcome::BuyPlaced { .. }));
    assert_eq!(h.gateway.total_placements(), 1);
}

// =============================================================================
// BuyPending
// =============================================================================

#[test]
fn test_buy_pending_is_idempotent() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let before = h.state();
    let saves = h.store.saves();

    assert_eq!(h.cycle().unwrap(), CycleOutcome::AwaitingFill);
    assert_eq!(h.cycle().unwrap(), CycleOutcome::AwaitingFill);

    assert_eq!(h.state(), before);
    assert_eq!(h.store.saves(), saves);
    assert_eq!(h.gateway.total_placements(), 1);
}

#[test]
fn test_unknown_entry_order_resets_to_idle() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    h.gateway.forget(&h.pending().order_id);

    match h.cycle().unwrap() {
        CycleOutcome::StateReset { reason } => assert!(reason.contains("unknown")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.state().is_idle());
    assert_eq!(h.notifier.count("state_reset"), 1);
}

#[test]
fn test_cancelled_entry_without_fill_returns_to_idle() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let order_id = h.pending().order_id;
    h.gateway.set_status(&order_id, OrderStatus::Cancelled);

    assert_eq!(h.cycle().unwrap(), CycleOutcome::EntryCancelled { order_id });
    assert!(h.state().is_idle());
    assert_eq!(h.notifier.count("buy_cancelled"), 1);
}

#[test]
fn test_stale_entry_is_cancelled_after_timeout() {
    let mut h = Harness::new(&FLAT_SERIES);
    h.asset.entry_timeout_minutes = Some(30);

    let order_id = h.gateway.seed_open_order(OrderRequest::limit_buy(
        ProductId::new(PRODUCT),
        money(dec!(100)),
        money(dec!(0.3)),
        entry_client_order_id(),
    ));
    let pending = PendingEntry {
        order_id: order_id.clone(),
        client_order_id: "rsibot-entry-x".to_string(),
        requested_price: money(dec!(100)),
        requested_size: money(dec!(0.3)),
        placed_at: Utc::now() - Duration::minutes(31),
    };
    h.store.save(PRODUCT, &PersistedTradeState::BuyPending(pending)).unwrap();

    assert_eq!(h.cycle().unwrap(), CycleOutcome::EntryCancelRequested { order_id: order_id.clone() });
    assert_eq!(h.gateway.cancel_calls.get(), 1);
    assert!(matches!(h.state(), PersistedTradeState::BuyPending(_)));

    // The cancel is observed on the following pass
    assert_eq!(h.cycle().unwrap(), CycleOutcome::EntryCancelled { order_id });
    assert!(h.state().is_idle());
}

#[test]
fn test_partial_fill_then_cancel_opens_position_for_filled_part() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let order_id = h.pending().order_id;
    h.gateway.fill_partial(&order_id, money(dec!(0.1)), OrderStatus::Cancelled);

    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionOpen { tiers: 3, placed: 3, .. }));
    let position = h.position();
    assert_eq!(position.fill_size, money(dec!(0.1)));

    let sold: Money = h.gateway.sells().iter().map(|o| o.request.size).sum();
    assert_eq!(sold, money(dec!(0.1)));
}

#[test]
fn test_status_failure_while_pending_leaves_state_untouched() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let before = h.state_bytes();
    let saves = h.store.saves();

    h.gateway.fail_status.set(true);
    let err = h.cycle().unwrap_err();
    assert!(matches!(err, TradingError::Exchange(ExchangeError::Transport(_))));
    assert_eq!(h.state_bytes(), before);
    assert_eq!(h.store.saves(), saves);
    assert_eq!(h.notifier.count("cycle_error"), 1);

    h.gateway.fail_status.set(false);
    assert_eq!(h.cycle().unwrap(), CycleOutcome::AwaitingFill);
}

#[test]
fn test_fill_too_small_for_last_tier_folds_it_backward() {
    let mut h = Harness::new(&BUY_SERIES);
    h.asset.quote_spend = money(dec!(10));
    h.asset.exit_tiers = vec![
        ExitTier::new(money(dec!(1)), money(dec!(0.48))),
        ExitTier::new(money(dec!(4)), money(dec!(0.48))),
        ExitTier::new(money(dec!(7)), money(dec!(0.04))),
    ];
    h.gateway.increments.base_increment = money(dec!(0.001));
    h.gateway.increments.min_order_size = money(dec!(0.01));

    h.cycle().unwrap();
    h.gateway.fill(&h.pending().order_id);
    assert_eq!(
        h.cycle().unwrap(),
        CycleOutcome::PositionOpen { tiers: 2, placed: 2, filled: 0 }
    );

    let sells: Vec<(Money, Money)> = h
        .gateway
        .sells()
        .iter()
        .map(|o| (o.request.price, o.request.size))
        .collect();
    assert_eq!(
        sells,
        vec![(money(dec!(101)), money(dec!(0.048))), (money(dec!(104)), money(dec!(0.052)))]
    );
}

// =============================================================================
// PositionOpen
// =============================================================================

#[test]
fn test_fill_places_every_tier_once() {
    let h = Harness::new(&BUY_SERIES);
    let position = h.open_position();

    let sells = h.gateway.sells();
    assert_eq!(sells.len(), 3);
    let prices: Vec<Money> = sells.iter().map(|o| o.request.price).collect();
    assert_eq!(prices, vec![money(dec!(101)), money(dec!(104)), money(dec!(107))]);
    let total: Money = sells.iter().map(|o| o.request.size).sum();
    assert_eq!(total, money(dec!(0.3)));

    assert_eq!(position.exit_orders.len(), 3);
    assert!(position
        .exit_orders
        .iter()
        .all(|o| o.status == ExitOrderStatus::Open && o.order_id.is_some()));
    assert_eq!(h.notifier.count("exit_placed"), 3);

    // Nothing new while the exits rest
    let saves = h.store.saves();
    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionOpen { filled: 0, .. }));
    assert_eq!(h.gateway.max_placements_per_client_id(), 1);
    assert_eq!(h.store.saves(), saves);
}

#[test]
fn test_full_round_trip_returns_to_idle() {
    let h = Harness::new(&BUY_SERIES);
    h.open_position();
    let sells = h.gateway.sells();

    h.gateway.fill(&sells[0].order_id);
    assert_eq!(
        h.cycle().unwrap(),
        CycleOutcome::PositionOpen { tiers: 3, placed: 3, filled: 1 }
    );

    h.gateway.fill(&sells[1].order_id);
    h.gateway.fill(&sells[2].order_id);
    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionClosed { .. }));
    assert!(h.state().is_idle());
    assert_eq!(h.notifier.count("exit_filled"), 3);

    let closed = h.notifier.events.borrow().iter().rev().find_map(|e| match e {
        TradeEvent::PositionClosed { sold_size, cost_basis, proceeds, .. } => {
            Some((*sold_size, *cost_basis, *proceeds))
        }
        _ => None,
    });
    let (sold, cost, proceeds) = closed.expect("position_closed event");
    assert_eq!(sold, money(dec!(0.3)));
    assert_eq!(cost, money(dec!(30)));
    assert!(proceeds > cost);

    // Back to evaluating the signal
    h.gateway.set_series(&FLAT_SERIES);
    assert_eq!(h.cycle().unwrap(), CycleOutcome::NoSignal);
}

#[test]
fn test_cancelled_exit_still_closes_position() {
    let h = Harness::new(&BUY_SERIES);
    h.open_position();
    let sells = h.gateway.sells();

    h.gateway.set_status(&sells[0].order_id, OrderStatus::Cancelled);
    h.gateway.fill(&sells[1].order_id);
    h.gateway.fill(&sells[2].order_id);

    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionClosed { .. }));
    assert!(h.state().is_idle());
}

#[test]
fn test_unknown_exit_order_resets_to_idle() {
    let h = Harness::new(&BUY_SERIES);
    h.open_position();
    h.gateway.forget(&h.gateway.sells()[1].order_id);

    assert!(matches!(h.cycle().unwrap(), CycleOutcome::StateReset { .. }));
    assert!(h.state().is_idle());
}

#[test]
fn test_rejected_exit_tier_does_not_block_close() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let entry_id = h.pending().order_id;
    h.gateway.reject_client_id(&exit_client_order_id(&entry_id, 1));
    h.gateway.fill(&entry_id);

    assert_eq!(
        h.cycle().unwrap(),
        CycleOutcome::PositionOpen { tiers: 3, placed: 3, filled: 0 }
    );
    let position = h.position();
    assert_eq!(position.exit_orders[1].status, ExitOrderStatus::Rejected);
    assert!(position.exit_orders[1].order_id.is_none());
    assert_eq!(h.notifier.count("cycle_error"), 1);

    let sells = h.gateway.sells();
    assert_eq!(sells.len(), 2);
    for sell in &sells {
        h.gateway.fill(&sell.order_id);
    }
    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionClosed { .. }));
    assert!(h.state().is_idle());

    let sold = h.notifier.events.borrow().iter().find_map(|e| match e {
        TradeEvent::PositionClosed { sold_size, .. } => Some(*sold_size),
        _ => None,
    });
    assert_eq!(sold, Some(money(dec!(0.2))));
}

#[test]
fn test_status_failure_during_exit_refresh_leaves_state_untouched() {
    let h = Harness::new(&BUY_SERIES);
    h.open_position();
    let before = h.state_bytes();
    let saves = h.store.saves();

    h.gateway.fail_status.set(true);
    let err = h.cycle().unwrap_err();
    assert!(matches!(err, TradingError::Exchange(ExchangeError::Transport(_))));
    assert_eq!(h.state_bytes(), before);
    assert_eq!(h.store.saves(), saves);
    assert_eq!(h.gateway.sells().len(), 3);
}

// =============================================================================
// Crash safety
// =============================================================================

#[test]
fn test_crash_after_exit_placed_does_not_place_it_again() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    h.gateway.fill(&h.pending().order_id);

    // Saves this cycle: open position, tier 0 intent, tier 0 acknowledgement
    h.store.fail_nth_save(3);
    assert!(matches!(h.cycle(), Err(TradingError::Persistence(_))));
    assert_eq!(h.gateway.sells().len(), 1);

    let stranded = h.position();
    assert_eq!(stranded.exit_orders.len(), 1);
    assert_eq!(stranded.exit_orders[0].status, ExitOrderStatus::Submitting);
    assert!(stranded.exit_orders[0].order_id.is_none());

    // Next invocation finds tier 0 by client id and places only the rest
    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionOpen { placed: 3, .. }));
    assert_eq!(h.gateway.sells().len(), 3);
    assert_eq!(h.gateway.max_placements_per_client_id(), 1);

    let position = h.position();
    assert_eq!(position.exit_orders[0].order_id.as_deref(), Some(h.gateway.sells()[0].order_id.as_str()));
    assert!(position.exit_orders.iter().all(|o| o.status == ExitOrderStatus::Open));
}

#[test]
fn test_crash_before_exit_sent_places_it_next_cycle() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    h.gateway.fill(&h.pending().order_id);

    // Intent save for tier 0 fails: nothing reaches the exchange
    h.store.fail_nth_save(2);
    assert!(h.cycle().is_err());
    assert!(h.gateway.sells().is_empty());
    assert!(h.position().exit_orders.is_empty());

    h.cycle().unwrap();
    assert_eq!(h.gateway.sells().len(), 3);
    assert_eq!(h.gateway.max_placements_per_client_id(), 1);
}

#[test]
fn test_exit_placement_failure_resumes_with_remaining_tiers() {
    let h = Harness::new(&BUY_SERIES);
    h.cycle().unwrap();
    let entry_id = h.pending().order_id;
    h.gateway.fill(&entry_id);

    // Tier 0 goes through, tier 1 times out
    h.gateway.placement_budget.set(Some(1));
    let err = h.cycle().unwrap_err();
    assert!(matches!(err, TradingError::Exchange(ExchangeError::Transport(_))));
    assert_eq!(h.gateway.sells().len(), 1);

    let stranded = h.position();
    assert_eq!(stranded.exit_orders.len(), 2);
    assert_eq!(stranded.exit_orders[0].status, ExitOrderStatus::Open);
    assert_eq!(stranded.exit_orders[1].status, ExitOrderStatus::Submitting);
    assert!(stranded.exit_orders[1].order_id.is_none());

    h.gateway.placement_budget.set(None);
    assert_eq!(
        h.cycle().unwrap(),
        CycleOutcome::PositionOpen { tiers: 3, placed: 3, filled: 0 }
    );
    assert_eq!(h.gateway.sells().len(), 3);
    assert_eq!(h.gateway.max_placements_per_client_id(), 1);
    for tier in 0..3 {
        assert_eq!(h.gateway.placements_for(&exit_client_order_id(&entry_id, tier)), 1);
    }
}

#[test]
fn test_stranded_intent_unknown_to_exchange_is_resubmitted() {
    let h = Harness::new(&FLAT_SERIES);
    let plan = vec![OrderParams {
        price: money(dec!(101)),
        size: money(dec!(0.3)),
    }];
    let mut position = OpenPosition::new("entry-1", money(dec!(100)), money(dec!(0.3)), Utc::now(), &plan);
    let intent = ExitOrderRecord::intent("entry-1", &position.exit_plan[0]);
    let client_id = intent.client_order_id.clone();
    position.exit_orders.push(intent);
    h.store
        .save(PRODUCT, &PersistedTradeState::PositionOpen(position))
        .unwrap();

    assert!(matches!(h.cycle().unwrap(), CycleOutcome::PositionOpen { tiers: 1, placed: 1, .. }));
    assert_eq!(h.gateway.placements_for(&client_id), 1);
    assert_eq!(h.position().exit_orders[0].status, ExitOrderStatus::Open);
}

// =============================================================================
// Pass driver and journal
// =============================================================================

#[test]
fn test_pass_processes_each_asset_independently() {
    let h = Harness::new(&BUY_SERIES);
    let assets = vec![
        AssetConfig::new("BTC-USD", money(dec!(30))),
        AssetConfig::new("ETH-USD", money(dec!(0.001))),
        AssetConfig::new("SOL-USD", money(dec!(30))),
    ];
    let manager = TradeManager::new(&h.store, &h.notifier, ManagerSettings::default());

    let summary = run_pass(&manager, &h.gateway, &assets);
    assert_eq!(summary.reports.len(), 3);
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.skipped(), 1);
    assert_eq!(h.gateway.total_placements(), 2);
    assert!(matches!(h.store.load("SOL-USD"), PersistedTradeState::BuyPending(_)));
}

#[test]
fn test_journal_records_completed_round_trip() {
    let h = Harness::new(&BUY_SERIES);
    let journal = TradeJournal::in_memory().unwrap();

    h.cycle_with(&journal).unwrap();
    h.gateway.fill(&h.pending().order_id);
    h.cycle_with(&journal).unwrap();
    for sell in h.gateway.sells() {
        h.gateway.fill(&sell.order_id);
    }
    h.cycle_with(&journal).unwrap();

    let trips = journal.round_trips(Some(PRODUCT)).unwrap();
    assert_eq!(trips.len(), 1);
    assert!(trips[0].net_pnl > 0.0);
    approx::assert_relative_eq!(trips[0].cost_basis, 30.0, epsilon = 1e-9);
    assert!(journal.event_count(PRODUCT).unwrap() >= 5);
}
