//! Run command implementation
//!
//! One pass over the configured assets: lock the state directory, run a
//! trade cycle per asset, log the summary.

use anyhow::{bail, Context, Result};
use rsi_tier_bot::exchange::coinbase::{ClientConfig, CoinbaseGateway, Credentials};
use rsi_tier_bot::journal::TradeJournal;
use rsi_tier_bot::notify::{FanoutNotifier, LogNotifier, WebhookNotifier};
use rsi_tier_bot::runner::{run_pass, select_assets, PassLock};
use rsi_tier_bot::{Config, ManagerSettings, PersistenceManager, TradeManager};
use tracing::{info, warn};

pub fn run(config_path: &str, asset_filter: Option<String>) -> Result<()> {
    info!("Starting trading pass");

    let config = Config::from_file(config_path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);

    let (api_key, api_secret) = match (&config.exchange.api_key, &config.exchange.api_secret) {
        (Some(key), Some(secret)) => (key.clone(), secret.clone()),
        _ => bail!("COINBASE_API_KEY and COINBASE_API_SECRET must be set"),
    };

    let assets = select_assets(&config.assets, asset_filter.as_deref())?;

    let _lock = PassLock::acquire(&config.bot.state_dir)
        .context("Another pass appears to be running")?;
    let store = PersistenceManager::new(&config.bot.state_dir)?;

    let mut gateway = CoinbaseGateway::new(
        Credentials::new(api_key, api_secret),
        ClientConfig::from(&config.exchange),
    )
    .context("Failed to build exchange client")?;
    for asset in &config.assets {
        gateway = gateway.with_granularity(asset.product_id.clone(), asset.candle_granularity);
    }

    let mut notifier = FanoutNotifier::new().with(LogNotifier);
    if let Some(url) = &config.bot.webhook_url {
        notifier = notifier.with(WebhookNotifier::new(url.as_str()).context("Failed to build webhook client")?);
    }
    if let Some(path) = &config.bot.journal_path {
        match TradeJournal::open(path) {
            Ok(journal) => notifier = notifier.with(journal),
            Err(e) => warn!("Trade journal unavailable, continuing without it: {:#}", e),
        }
    }

    let manager = TradeManager::new(&store, &notifier, ManagerSettings::default());
    let summary = run_pass(&manager, &gateway, assets);
    summary.log();

    if summary.failed() > summary.skipped() {
        warn!("{} asset(s) failed this pass", summary.failed() - summary.skipped());
    }
    Ok(())
}
