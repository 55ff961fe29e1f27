// Trade Journal
// SQLite audit trail of every trade event and completed round trip.
//
// The JSON state files stay the source of truth; the journal is
// append-only history for reporting.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::notify::{Notifier, TradeEvent};

// =============================================================================
// Data Models
// =============================================================================

/// One completed entry-to-exit cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTrip {
    pub id: Option<i64>,
    pub product_id: String,
    pub entry_order_id: String,
    pub entry_time: String,
    pub exit_time: String,
    pub fill_price: f64,
    pub fill_size: f64,
    pub sold_size: f64,
    pub cost_basis: f64,
    pub proceeds: f64,
    pub net_pnl: f64,
    pub pnl_pct: f64,
}

// =============================================================================
// Journal Implementation
// =============================================================================

pub struct TradeJournal {
    conn: Mutex<Connection>,
}

impl TradeJournal {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let journal = Self::from_connection(conn)?;
        info!("Trade journal opened at {}", db_path.display());
        Ok(journal)
    }

    /// Journal backed by an in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.create_tables()?;
        Ok(journal)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                product_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS round_trips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id TEXT NOT NULL,
                entry_order_id TEXT NOT NULL UNIQUE,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                fill_price REAL NOT NULL,
                fill_size REAL NOT NULL,
                sold_size REAL NOT NULL,
                cost_basis REAL NOT NULL,
                proceeds REAL NOT NULL,
                net_pnl REAL NOT NULL,
                pnl_pct REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_product ON events(product_id)",
            [],
        )?;

        debug!("Journal schema created/verified");
        Ok(())
    }

    pub fn record_event(&self, event: &TradeEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.conn().execute(
            "INSERT INTO events (recorded_at, product_id, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                event.product_id().as_str(),
                event.kind(),
                payload
            ],
        )?;
        Ok(())
    }

    /// Insert a round trip; a repeat for the same entry order is ignored
    pub fn record_round_trip(&self, trip: &RoundTrip) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO round_trips
             (product_id, entry_order_id, entry_time, exit_time, fill_price, fill_size,
              sold_size, cost_basis, proceeds, net_pnl, pnl_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trip.product_id,
                trip.entry_order_id,
                trip.entry_time,
                trip.exit_time,
                trip.fill_price,
                trip.fill_size,
                trip.sold_size,
                trip.cost_basis,
                trip.proceeds,
                trip.net_pnl,
                trip.pnl_pct,
            ],
        )?;

        let result = if trip.net_pnl > 0.0 { "WIN" } else { "LOSS" };
        info!(
            "Round trip recorded: {} {:.8} @ {:.2} | Net: {:.2} ({:+.2}%) | {}",
            trip.product_id, trip.fill_size, trip.fill_price, trip.net_pnl, trip.pnl_pct, result
        );
        Ok(())
    }

    pub fn round_trips(&self, product_id: Option<&str>) -> Result<Vec<RoundTrip>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, product_id, entry_order_id, entry_time, exit_time, fill_price, fill_size,
                    sold_size, cost_basis, proceeds, net_pnl, pnl_pct
             FROM round_trips
             WHERE ?1 IS NULL OR product_id = ?1
             ORDER BY id",
        )?;
        let trips = stmt
            .query_map(params![product_id], |row| {
                Ok(RoundTrip {
                    id: row.get(0)?,
                    product_id: row.get(1)?,
                    entry_order_id: row.get(2)?,
                    entry_time: row.get(3)?,
                    exit_time: row.get(4)?,
                    fill_price: row.get(5)?,
                    fill_size: row.get(6)?,
                    sold_size: row.get(7)?,
                    cost_basis: row.get(8)?,
                    proceeds: row.get(9)?,
                    net_pnl: row.get(10)?,
                    pnl_pct: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trips)
    }

    pub fn event_count(&self, product_id: &str) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM events WHERE product_id = ?1",
            params![product_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Realized P&L across all recorded round trips
    pub fn total_pnl(&self) -> Result<f64> {
        let total: Option<f64> =
            self.conn()
                .query_row("SELECT SUM(net_pnl) FROM round_trips", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0.0))
    }
}

fn round_trip_from(event: &TradeEvent) -> Option<RoundTrip> {
    match event {
        TradeEvent::PositionClosed {
            product_id,
            entry_order_id,
            filled_at,
            fill_price,
            fill_size,
            sold_size,
            cost_basis,
            proceeds,
        } => {
            let net = *proceeds - *cost_basis;
            let pnl_pct = if cost_basis.is_positive() {
                (net / *cost_basis).to_f64() * 100.0
            } else {
                0.0
            };
            Some(RoundTrip {
                id: None,
                product_id: product_id.to_string(),
                entry_order_id: entry_order_id.clone(),
                entry_time: filled_at.to_rfc3339(),
                exit_time: Utc::now().to_rfc3339(),
                fill_price: fill_price.to_f64(),
                fill_size: fill_size.to_f64(),
                sold_size: sold_size.to_f64(),
                cost_basis: cost_basis.to_f64(),
                proceeds: proceeds.to_f64(),
                net_pnl: net.to_f64(),
                pnl_pct,
            })
        }
        _ => None,
    }
}

impl Notifier for TradeJournal {
    fn notify(&self, event: &TradeEvent) {
        if let Err(e) = self.record_event(event) {
            warn!("[{}] Journal write failed: {:#}", event.product_id(), e);
        }
        if let Some(trip) = round_trip_from(event) {
            if let Err(e) = self.record_round_trip(&trip) {
                warn!("[{}] Journal round trip write failed: {:#}", event.product_id(), e);
            }
        }
    }
}
