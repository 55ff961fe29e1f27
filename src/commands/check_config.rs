//! Check-config command implementation

use anyhow::{Context, Result};
use rsi_tier_bot::Config;
use tracing::info;

pub fn run(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path))?;

    info!("Configuration {} is valid", config_path);
    info!("State dir: {}", config.bot.state_dir.display());
    match &config.bot.journal_path {
        Some(path) => info!("Journal: {}", path.display()),
        None => info!("Journal: disabled"),
    }
    info!(
        "Credentials: {}",
        if config.exchange.api_key.is_some() && config.exchange.api_secret.is_some() {
            "present"
        } else {
            "MISSING (set COINBASE_API_KEY / COINBASE_API_SECRET)"
        }
    );

    for asset in &config.assets {
        let tiers = asset
            .exit_tiers
            .iter()
            .map(|t| format!("+{}% x {}", t.profit_pct, t.portion.round_dp(4)))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            "  {:<12} RSI({}) < {} on {} | spend {} | exits: {}",
            asset.product_id,
            asset.rsi_period,
            asset.rsi_threshold,
            asset.candle_granularity.as_str(),
            asset.quote_spend,
            tiers
        );
    }
    Ok(())
}
