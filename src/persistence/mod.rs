//! SQLite persistence for the position ledger.
//!
//! Persists trading state to survive restarts:
//! - Live positions and positions awaiting settlement
//! - Settlement history (append-only)
//! - Paper account balance and last save time

use crate::ledger::{Position, PositionLedger, SettlementRecord};
use crate::market::{Cohort, Side};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Everything needed to rebuild the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedLedger {
    pub live: Vec<Position>,
    pub awaiting: Vec<Position>,
    pub settlements: Vec<SettlementRecord>,
    pub paper_balance: Option<Decimal>,
    pub last_saved: Option<DateTime<Utc>>,
}

impl PersistedLedger {
    pub fn into_ledger(self) -> PositionLedger {
        PositionLedger::restore(self.live, self.awaiting, self.settlements)
    }
}

/// Current open positions, as handed to `save`.
#[derive(Debug, Clone, Default)]
pub struct PositionSnapshot {
    pub live: Vec<Position>,
    pub awaiting: Vec<Position>,
    pub paper_balance: Option<Decimal>,
}

impl PositionSnapshot {
    pub fn from_ledger(ledger: &PositionLedger, paper_balance: Option<Decimal>) -> Self {
        Self {
            live: ledger.positions().cloned().collect(),
            awaiting: ledger.awaiting_settlement().cloned().collect(),
            paper_balance,
        }
    }
}

/// Storage contract for ledger state.
pub trait LedgerStore: Send {
    fn load(&self) -> Result<PersistedLedger>;

    /// Replace the stored positions and append `settlement` when given.
    fn save(&self, positions: &PositionSnapshot, settlement: Option<&SettlementRecord>) -> Result<()>;
}

/// SQLite-based ledger store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the database, creating the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Ledger store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            -- Engine state (singleton row)
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                paper_balance TEXT,
                last_saved TEXT NOT NULL
            );

            -- Open positions, live or rolled and awaiting an outcome
            CREATE TABLE IF NOT EXISTS positions (
                condition_id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                asset TEXT NOT NULL,
                cohort TEXT NOT NULL,
                expiry TEXT NOT NULL,
                up_shares TEXT NOT NULL,
                down_shares TEXT NOT NULL,
                up_cost TEXT NOT NULL,
                down_cost TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                awaiting INTEGER NOT NULL
            );

            -- Settlement history
            CREATE TABLE IF NOT EXISTS settlements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                condition_id TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                asset TEXT NOT NULL,
                cohort TEXT NOT NULL,
                outcome TEXT NOT NULL,
                up_shares TEXT NOT NULL,
                down_shares TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                payout TEXT NOT NULL,
                profit TEXT NOT NULL,
                settled_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settlements_settled_at ON settlements(settled_at);
            "#,
            )
            .context("Failed to initialize schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn load_positions(&self) -> Result<(Vec<Position>, Vec<Position>)> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT condition_id, label, asset, cohort, expiry, up_shares, down_shares,
                   up_cost, down_cost, updated_at, awaiting
            FROM positions
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                let position = Position {
                    condition_id: row.get(0)?,
                    label: row.get(1)?,
                    asset: row.get(2)?,
                    cohort: cohort_col(row, 3)?,
                    expiry: time_col(row, 4)?,
                    up_shares: decimal_col(row, 5)?,
                    down_shares: decimal_col(row, 6)?,
                    up_cost: decimal_col(row, 7)?,
                    down_cost: decimal_col(row, 8)?,
                    updated_at: time_col(row, 9)?,
                };
                let awaiting: bool = row.get(10)?;
                Ok((position, awaiting))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read positions")?;

        let (awaiting, live): (Vec<_>, Vec<_>) = rows.into_iter().partition(|(_, awaiting)| *awaiting);
        Ok((
            live.into_iter().map(|(p, _)| p).collect(),
            awaiting.into_iter().map(|(p, _)| p).collect(),
        ))
    }

    fn load_settlements(&self) -> Result<Vec<SettlementRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT condition_id, label, asset, cohort, outcome, up_shares, down_shares,
                   total_cost, payout, profit, settled_at
            FROM settlements
            ORDER BY id
            "#,
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(SettlementRecord {
                    condition_id: row.get(0)?,
                    label: row.get(1)?,
                    asset: row.get(2)?,
                    cohort: cohort_col(row, 3)?,
                    outcome: side_col(row, 4)?,
                    up_shares: decimal_col(row, 5)?,
                    down_shares: decimal_col(row, 6)?,
                    total_cost: decimal_col(row, 7)?,
                    payout: decimal_col(row, 8)?,
                    profit: decimal_col(row, 9)?,
                    settled_at: time_col(row, 10)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read settlements")?;
        Ok(records)
    }
}

impl LedgerStore for SqliteStore {
    fn load(&self) -> Result<PersistedLedger> {
        let state: Option<(Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT paper_balance, last_saved FROM engine_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (live, awaiting) = self.load_positions()?;
        let settlements = self.load_settlements()?;

        let (paper_balance, last_saved) = match state {
            Some((balance, saved)) => (
                balance.and_then(|b| Decimal::from_str(&b).ok()),
                DateTime::parse_from_rfc3339(&saved)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
            ),
            None => (None, None),
        };

        info!(
            live = live.len(),
            awaiting = awaiting.len(),
            settlements = settlements.len(),
            "Loaded ledger from database"
        );

        Ok(PersistedLedger {
            live,
            awaiting,
            settlements,
            paper_balance,
            last_saved,
        })
    }

    fn save(&self, positions: &PositionSnapshot, settlement: Option<&SettlementRecord>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO engine_state (id, paper_balance, last_saved)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                paper_balance = ?1,
                last_saved = ?2
            "#,
            params![
                positions.paper_balance.map(|b| b.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        // Clear and reinsert positions
        tx.execute("DELETE FROM positions", [])?;

        let rows = positions
            .live
            .iter()
            .map(|p| (p, false))
            .chain(positions.awaiting.iter().map(|p| (p, true)));
        for (pos, awaiting) in rows {
            tx.execute(
                r#"
                INSERT INTO positions (condition_id, label, asset, cohort, expiry, up_shares,
                                       down_shares, up_cost, down_cost, updated_at, awaiting)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    pos.condition_id,
                    pos.label,
                    pos.asset,
                    pos.cohort.key(),
                    pos.expiry.to_rfc3339(),
                    pos.up_shares.to_string(),
                    pos.down_shares.to_string(),
                    pos.up_cost.to_string(),
                    pos.down_cost.to_string(),
                    pos.updated_at.to_rfc3339(),
                    awaiting,
                ],
            )?;
        }

        if let Some(record) = settlement {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO settlements (condition_id, label, asset, cohort, outcome,
                                                   up_shares, down_shares, total_cost, payout,
                                                   profit, settled_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    record.condition_id,
                    record.label,
                    record.asset,
                    record.cohort.key(),
                    record.outcome.as_str(),
                    record.up_shares.to_string(),
                    record.down_shares.to_string(),
                    record.total_cost.to_string(),
                    record.payout.to_string(),
                    record.profit.to_string(),
                    record.settled_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit().context("Failed to commit ledger save")?;

        debug!(
            live = positions.live.len(),
            awaiting = positions.awaiting.len(),
            settlement = settlement.map(|s| s.label.as_str()),
            "Ledger saved to database"
        );
        Ok(())
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, e.to_string()))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn cohort_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Cohort> {
    let text: String = row.get(idx)?;
    Cohort::from_key(&text).ok_or_else(|| conversion_error(idx, format!("unknown cohort {}", text)))
}

fn side_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Side> {
    let text: String = row.get(idx)?;
    Side::from_str(&text).map_err(|e| conversion_error(idx, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Market;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn market(id: &str) -> Market {
        Market {
            condition_id: id.to_string(),
            label: format!("btc-updown-15m-{}", id),
            asset: "btc".to_string(),
            expiry: Utc.timestamp_opt(1_768_534_200, 0).unwrap(),
            up_token: format!("{}-up", id),
            down_token: format!("{}-down", id),
            cohort: Cohort::FifteenMin,
        }
    }

    #[test]
    fn test_empty_database_loads_empty_ledger() {
        let store = SqliteStore::new(":memory:").unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, PersistedLedger::default());
    }

    #[test]
    fn test_save_and_load_ledger() {
        let store = SqliteStore::new(":memory:").unwrap();
        let now = Utc.timestamp_opt(1_768_533_600, 0).unwrap();

        let mut ledger = PositionLedger::new();
        ledger
            .record_fill_at(&market("c1"), Side::Up, dec!(60), dec!(24), now)
            .unwrap();
        ledger
            .record_fill_at(&market("c1"), Side::Down, dec!(40), dec!(20), now)
            .unwrap();
        ledger
            .record_fill_at(&market("c2"), Side::Up, dec!(10.5), dec!(4.2), now)
            .unwrap();
        ledger.roll_cohort(Cohort::FifteenMin, Utc.timestamp_opt(1_768_534_200, 0).unwrap());
        let record = ledger.settle("c1", Side::Down, now).unwrap();

        let snapshot = PositionSnapshot::from_ledger(&ledger, Some(dec!(955.8)));
        store.save(&snapshot, Some(&record)).unwrap();
        // Saving again must not duplicate the settlement
        store.save(&snapshot, Some(&record)).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.live.is_empty());
        assert_eq!(loaded.awaiting.len(), 1);
        assert_eq!(loaded.awaiting[0].up_shares, dec!(10.5));
        assert_eq!(loaded.settlements.len(), 1);
        assert_eq!(loaded.settlements[0].profit, dec!(-4));
        assert_eq!(loaded.settlements[0].outcome, Side::Down);
        assert_eq!(loaded.paper_balance, Some(dec!(955.8)));

        let restored = loaded.into_ledger();
        assert_eq!(restored.realized_pnl(), dec!(-4));
        assert_eq!(restored.awaiting_settlement().count(), 1);
    }

    #[test]
    fn test_positions_are_replaced_on_save() {
        let store = SqliteStore::new(":memory:").unwrap();
        let mut ledger = PositionLedger::new();
        ledger
            .record_fill(&market("c1"), Side::Up, dec!(5), dec!(2))
            .unwrap();
        store.save(&PositionSnapshot::from_ledger(&ledger, None), None).unwrap();

        store.save(&PositionSnapshot::default(), None).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.live.is_empty());
        assert!(loaded.last_saved.is_some());
    }

    #[test]
    fn test_corrupt_decimal_is_an_error() {
        let store = SqliteStore::new(":memory:").unwrap();
        store
            .conn
            .execute(
                "INSERT INTO settlements (condition_id, label, asset, cohort, outcome, up_shares,
                 down_shares, total_cost, payout, profit, settled_at)
                 VALUES ('c1', 'l', 'btc', '15min', 'up', 'abc', '0', '0', '0', '0', '2026-01-16T03:00:00Z')",
                [],
            )
            .unwrap();
        assert!(store.load().is_err());
    }
}
