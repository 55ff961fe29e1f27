//! Durable per-asset state files
//!
//! Each asset lives in `<state_dir>/<asset_id>_trade_state.json`. Writes go
//! to a temporary file in the same directory which is fsynced and renamed over
//! the target, so a reader sees either the old record or the new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::error::TradingError;
use crate::state::PersistedTradeState;

const STATE_FILE_SUFFIX: &str = "_trade_state.json";

/// Load/save seam between the trade manager and durable storage
pub trait StateStore {
    /// Current state; `Idle` when nothing usable is stored
    fn load(&self, asset_id: &str) -> PersistedTradeState;

    /// Replace the stored state atomically
    fn save(&self, asset_id: &str, state: &PersistedTradeState) -> Result<(), TradingError>;
}

/// On-disk envelope around the state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub asset_id: String,
    pub updated_at: DateTime<Utc>,
    pub state: PersistedTradeState,
}

// =============================================================================
// File-backed store
// =============================================================================

pub struct PersistenceManager {
    dir: PathBuf,
}

impl PersistenceManager {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, TradingError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| {
            TradingError::Persistence(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, asset_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", asset_id, STATE_FILE_SUFFIX))
    }

    /// Read the full envelope. `Ok(None)` when the file does not exist.
    pub fn load_record(&self, asset_id: &str) -> Result<Option<StateRecord>, TradingError> {
        let path = self.path_for(asset_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TradingError::Persistence(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let record: StateRecord = serde_json::from_str(&contents).map_err(|e| {
            TradingError::Persistence(format!("corrupt state file {}: {}", path.display(), e))
        })?;

        if record.asset_id != asset_id {
            return Err(TradingError::Persistence(format!(
                "state file {} belongs to {}",
                path.display(),
                record.asset_id
            )));
        }

        Ok(Some(record))
    }

    /// Asset ids that have a state file, sorted
    pub fn list_assets(&self) -> Result<Vec<String>, TradingError> {
        let mut assets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(asset) = name
                .to_str()
                .and_then(|n| n.strip_suffix(STATE_FILE_SUFFIX))
            {
                assets.push(asset.to_string());
            }
        }
        assets.sort();
        Ok(assets)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), TradingError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| TradingError::Persistence(format!("rename to {}: {}", path.display(), e)))?;

        // Make the rename itself durable
        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

impl StateStore for PersistenceManager {
    fn load(&self, asset_id: &str) -> PersistedTradeState {
        match self.load_record(asset_id) {
            Ok(Some(record)) => {
                debug!("[{}] Loaded state {} (updated {})", asset_id, record.state.phase(), record.updated_at);
                record.state
            }
            Ok(None) => {
                debug!("[{}] No state file, starting idle", asset_id);
                PersistedTradeState::Idle
            }
            Err(e) => {
                error!("[{}] Discarding unreadable state: {}", asset_id, e);
                PersistedTradeState::Idle
            }
        }
    }

    fn save(&self, asset_id: &str, state: &PersistedTradeState) -> Result<(), TradingError> {
        let record = StateRecord {
            asset_id: asset_id.to_string(),
            updated_at: Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        let path = self.path_for(asset_id);
        self.write_atomic(&path, &json)?;
        debug!("[{}] Saved state {} to {}", asset_id, state.phase(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExitOrderRecord, ExitOrderStatus, OpenPosition, PendingEntry};
    use crate::types::{Money, OrderParams};
    use rust_decimal_macros::dec;

    fn manager() -> (tempfile::TempDir, PersistenceManager) {
        let dir = tempfile::tempdir().unwrap();
        let pm = PersistenceManager::new(dir.path()).unwrap();
        (dir, pm)
    }

    fn pending() -> PersistedTradeState {
        PersistedTradeState::BuyPending(PendingEntry {
            order_id: "ord-1".to_string(),
            client_order_id: "rsibot-entry-x".to_string(),
            requested_price: Money::from(dec!(200.12)),
            requested_size: Money::from(dec!(0.0999)),
            placed_at: Utc::now(),
        })
    }

    fn open_position() -> PersistedTradeState {
        let plan = [
            OrderParams {
                price: Money::from(dec!(101)),
                size: Money::from(dec!(0.1)),
            },
            OrderParams {
                price: Money::from(dec!(104)),
                size: Money::from(dec!(0.2)),
            },
        ];
        let mut pos = OpenPosition::new("ord-1", Money::from_i64(100), Money::from(dec!(0.3)), Utc::now(), &plan);
        let mut rec = ExitOrderRecord::intent("ord-1", &pos.exit_plan[0]);
        rec.order_id = Some("exit-1".to_string());
        rec.status = ExitOrderStatus::Open;
        pos.exit_orders.push(rec);
        PersistedTradeState::PositionOpen(pos)
    }

    #[test]
    fn test_missing_file_loads_idle() {
        let (_dir, pm) = manager();
        assert_eq!(pm.load("BTC-USD"), PersistedTradeState::Idle);
        assert!(pm.load_record("BTC-USD").unwrap().is_none());
    }

    #[test]
    fn test_round_trip_every_variant() {
        let (_dir, pm) = manager();
        for state in [PersistedTradeState::Idle, pending(), open_position()] {
            pm.save("BTC-USD", &state).unwrap();
            assert_eq!(pm.load("BTC-USD"), state);
        }
    }

    #[test]
    fn test_corrupt_file_loads_idle() {
        let (_dir, pm) = manager();
        fs::write(pm.path_for("ETH-USD"), "{ not json").unwrap();
        assert_eq!(pm.load("ETH-USD"), PersistedTradeState::Idle);
        assert!(pm.load_record("ETH-USD").is_err());
    }

    #[test]
    fn test_foreign_record_loads_idle() {
        let (_dir, pm) = manager();
        pm.save("BTC-USD", &pending()).unwrap();
        fs::copy(pm.path_for("BTC-USD"), pm.path_for("ETH-USD")).unwrap();
        assert_eq!(pm.load("ETH-USD"), PersistedTradeState::Idle);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (dir, pm) = manager();
        pm.save("BTC-USD", &pending()).unwrap();
        pm.save("BTC-USD", &open_position()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["BTC-USD_trade_state.json".to_string()]);
    }

    #[test]
    fn test_list_assets() {
        let (dir, pm) = manager();
        pm.save("SOL-USD", &PersistedTradeState::Idle).unwrap();
        pm.save("BTC-USD", &pending()).unwrap();
        fs::write(dir.path().join("journal.db"), b"").unwrap();
        assert_eq!(pm.list_assets().unwrap(), vec!["BTC-USD", "SOL-USD"]);
    }

    #[test]
    fn test_envelope_has_timestamp() {
        let (_dir, pm) = manager();
        let before = Utc::now();
        pm.save("BTC-USD", &pending()).unwrap();
        let record = pm.load_record("BTC-USD").unwrap().unwrap();
        assert_eq!(record.asset_id, "BTC-USD");
        assert!(record.updated_at >= before);
    }
}
