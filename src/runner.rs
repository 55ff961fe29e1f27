//! Single-pass driver
//!
//! Holds the state directory lock, runs one trade cycle per configured asset
//! in order and collects a summary. A failing asset never stops the pass.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::AssetConfig;
use crate::error::TradingError;
use crate::exchange::ExchangeGateway;
use crate::trade_manager::{CycleOutcome, TradeManager};

pub const LOCK_FILE_NAME: &str = ".lock";

/// Exclusive marker that no other pass is running against a state directory.
/// Removed when dropped.
#[derive(Debug)]
pub struct PassLock {
    path: PathBuf,
}

impl PassLock {
    pub fn acquire(state_dir: impl AsRef<Path>) -> Result<Self, TradingError> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(TradingError::Persistence(format!(
                    "another pass holds {} ({}); remove it if that process is gone",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        // Best effort; the file's existence is the lock
        let _ = writeln!(file, "pid {} since {}", std::process::id(), chrono::Utc::now().to_rfc3339());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PassLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}

/// Result of one asset within a pass
#[derive(Debug)]
pub struct AssetReport {
    pub product_id: String,
    pub result: Result<CycleOutcome, TradingError>,
}

impl AssetReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub reports: Vec<AssetReport>,
}

impl PassSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    /// Assets skipped for reasons that resolve on their own
    /// (not enough candles yet, order below the venue minimum)
    pub fn skipped(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| {
                matches!(
                    r.result,
                    Err(TradingError::InsufficientData { .. }) | Err(TradingError::OrderTooSmall(_))
                )
            })
            .count()
    }

    pub fn log(&self) {
        info!("{}", "=".repeat(60));
        info!("PASS SUMMARY");
        info!("{}", "=".repeat(60));
        for report in &self.reports {
            match &report.result {
                Ok(outcome) => info!("  {:<12} {}", report.product_id, outcome),
                Err(e) => info!("  {:<12} FAILED: {}", report.product_id, e),
            }
        }
        info!(
            "{} assets: {} ok, {} failed ({} skipped)",
            self.reports.len(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        );
    }
}

/// Run one cycle for every asset, continuing past failures
pub fn run_pass<'a>(
    manager: &TradeManager<'_>,
    exchange: &dyn ExchangeGateway,
    assets: impl IntoIterator<Item = &'a AssetConfig>,
) -> PassSummary {
    let mut summary = PassSummary::default();

    for asset in assets {
        let product_id = asset.product_id.to_string();
        info!("[{}] Processing", product_id);

        let result = manager.run_cycle(asset, exchange);
        match &result {
            Ok(outcome) => info!("[{}] {}", product_id, outcome),
            Err(e @ TradingError::InsufficientData { .. }) | Err(e @ TradingError::OrderTooSmall(_)) => {
                warn!("[{}] Skipped: {}", product_id, e)
            }
            Err(e) => error!("[{}] Cycle failed: {}", product_id, e),
        }

        summary.reports.push(AssetReport { product_id, result });
    }

    summary
}

/// Configured assets, narrowed to one product when `only` is given
pub fn select_assets<'a>(assets: &'a [AssetConfig], only: Option<&str>) -> Result<Vec<&'a AssetConfig>, TradingError> {
    match only {
        None => Ok(assets.iter().collect()),
        Some(id) => assets
            .iter()
            .find(|a| a.product_id.as_str().eq_ignore_ascii_case(id))
            .map(|a| vec![a])
            .ok_or_else(|| TradingError::Config(format!("asset {} is not configured", id))),
    }
}
