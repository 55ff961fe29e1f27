//! Status command implementation
//!
//! Prints the persisted state of every configured asset without touching
//! the exchange.

use anyhow::Result;
use rsi_tier_bot::state::OpenPosition;
use rsi_tier_bot::{Config, PersistedTradeState, PersistenceManager};
use tracing::{info, warn};

pub fn run(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;
    let store = PersistenceManager::new(&config.bot.state_dir)?;

    info!("{}", "=".repeat(60));
    info!("STATE ({})", store.dir().display());
    info!("{}", "=".repeat(60));

    for asset in &config.assets {
        let id = asset.product_id.as_str();
        match store.load_record(id) {
            Ok(None) => info!("{:<12} idle (no state file)", id),
            Ok(Some(record)) => {
                let updated = record.updated_at.format("%Y-%m-%d %H:%M:%S UTC");
                match &record.state {
                    PersistedTradeState::Idle => info!("{:<12} idle (updated {})", id, updated),
                    PersistedTradeState::BuyPending(p) => info!(
                        "{:<12} buy pending: {} @ {} order {} placed {} (updated {})",
                        id,
                        p.requested_size,
                        p.requested_price,
                        p.order_id,
                        p.placed_at.format("%Y-%m-%d %H:%M"),
                        updated
                    ),
                    PersistedTradeState::PositionOpen(pos) => {
                        info!(
                            "{:<12} position open: {} @ {} entry {} (updated {})",
                            id, pos.fill_size, pos.fill_price, pos.entry_order_id, updated
                        );
                        log_exits(pos);
                    }
                }
            }
            Err(e) => warn!("{:<12} unreadable: {}", id, e),
        }
    }

    let orphans: Vec<String> = store
        .list_assets()?
        .into_iter()
        .filter(|a| config.asset(a).is_none())
        .collect();
    if !orphans.is_empty() {
        warn!("State files for unconfigured assets: {}", orphans.join(", "));
    }
    Ok(())
}

fn log_exits(position: &OpenPosition) {
    for plan in &position.exit_plan {
        let record = position
            .exit_orders
            .iter()
            .find(|o| o.tier_index == plan.tier_index);
        match record {
            Some(o) => info!(
                "    tier {} SELL {} @ {} {} {}",
                plan.tier_index,
                o.size,
                o.price,
                o.status,
                o.order_id.as_deref().unwrap_or("-")
            ),
            None => info!("    tier {} SELL {} @ {} not placed", plan.tier_index, plan.size, plan.price),
        }
    }
}
