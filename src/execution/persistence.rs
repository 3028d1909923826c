use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};

use crate::execution::types::{BalanceRecord, Outcome, Position, PositionStatus, Side};

pub struct PositionStore {
    conn: Connection,
}

impl PositionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(db_path)?)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                bracket TEXT NOT NULL,
                bracket_floor REAL,
                bracket_ceiling REAL,
                tier TEXT NOT NULL,
                question TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                shares REAL NOT NULL,
                cost REAL NOT NULL,
                opened_at TIMESTAMP NOT NULL,
                closed_at TIMESTAMP,
                outcome TEXT,
                pnl REAL,
                status TEXT NOT NULL DEFAULT 'open'
            );

            CREATE TABLE IF NOT EXISTS balance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                balance REAL NOT NULL,
                recorded_at TIMESTAMP NOT NULL,
                note TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
            CREATE INDEX IF NOT EXISTS idx_positions_date ON positions(date);
            "#,
        )?;

        Ok(Self { conn })
    }

    /// Insert a position and append the post-open balance row in one
    /// transaction; mirrors `close_position` so the book and the balance
    /// trail can never disagree after a crash between the two writes.
    pub fn open_position(&mut self, pos: &Position, new_balance: f64, note: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO positions (id, date, bracket, bracket_floor, bracket_ceiling, tier,
                                    question, side, entry_price, shares, cost, opened_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                pos.id,
                pos.date.to_string(),
                pos.bracket,
                pos.bracket_floor,
                pos.bracket_ceiling,
                pos.tier,
                pos.question,
                pos.side.as_str(),
                pos.entry_price,
                pos.shares,
                pos.cost,
                pos.opened_at.to_rfc3339(),
                pos.status.as_str(),
            ],
        )?;
        tx.execute(
            "INSERT INTO balance_history (balance, recorded_at, note) VALUES (?1, ?2, ?3)",
            params![new_balance, Utc::now().to_rfc3339(), note],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn position(&self, id: &str) -> Result<Option<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE id = ?1",
            SELECT_POSITIONS
        ))?;
        let mut rows = stmt.query_map(params![id], row_to_position)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let count: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn open_positions_for_date(&self, date: NaiveDate) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'open' AND date = ?1 ORDER BY opened_at",
            SELECT_POSITIONS
        ))?;
        let rows = stmt.query_map(params![date.to_string()], row_to_position)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    pub fn closed_positions_for_date(&self, date: NaiveDate) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'closed' AND date = ?1 ORDER BY opened_at",
            SELECT_POSITIONS
        ))?;
        let rows = stmt.query_map(params![date.to_string()], row_to_position)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Close a position and append the balance row in one transaction, so a
    /// crash between the two cannot leave the trail inconsistent.
    pub fn close_position(
        &mut self,
        id: &str,
        outcome: Outcome,
        pnl: f64,
        new_balance: f64,
        note: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE positions SET status = 'closed', closed_at = ?1, outcome = ?2, pnl = ?3
             WHERE id = ?4",
            params![now, outcome.as_str(), pnl, id],
        )?;
        tx.execute(
            "INSERT INTO balance_history (balance, recorded_at, note) VALUES (?1, ?2, ?3)",
            params![new_balance, now, note],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_balance(&self, balance: f64, note: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO balance_history (balance, recorded_at, note) VALUES (?1, ?2, ?3)",
            params![balance, Utc::now().to_rfc3339(), note],
        )?;
        Ok(())
    }

    /// Most recent recorded balance, used to resume after a restart.
    pub fn latest_balance(&self) -> Result<Option<f64>> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance FROM balance_history ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(balance)
    }

    pub fn balance_history(&self) -> Result<Vec<BalanceRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT balance, recorded_at, note FROM balance_history ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let recorded_at_str: String = row.get(1)?;
            Ok(BalanceRecord {
                balance: row.get(0)?,
                recorded_at: parse_ts(&recorded_at_str),
                note: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }
}

const SELECT_POSITIONS: &str = "SELECT id, date, bracket, bracket_floor, bracket_ceiling, tier,
        question, side, entry_price, shares, cost, opened_at, closed_at, outcome, pnl, status
 FROM positions";

fn row_to_position(row: &Row) -> rusqlite::Result<Position> {
    let date_str: String = row.get(1)?;
    let side_str: String = row.get(7)?;
    let opened_at_str: String = row.get(11)?;
    let closed_at_str: Option<String> = row.get(12)?;
    let outcome_str: Option<String> = row.get(13)?;
    let status_str: String = row.get(15)?;

    Ok(Position {
        id: row.get(0)?,
        date: date_str.parse().unwrap_or_default(),
        bracket: row.get(2)?,
        bracket_floor: row.get(3)?,
        bracket_ceiling: row.get(4)?,
        tier: row.get(5)?,
        question: row.get(6)?,
        side: Side::parse(&side_str).unwrap_or(Side::No),
        entry_price: row.get(8)?,
        shares: row.get(9)?,
        cost: row.get(10)?,
        opened_at: parse_ts(&opened_at_str),
        closed_at: closed_at_str.map(|s| parse_ts(&s)),
        outcome: outcome_str.as_deref().and_then(Outcome::parse),
        pnl: row.get(14)?,
        status: if status_str == "closed" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Position {
        Position {
            id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 2, 22).unwrap(),
            bracket: "13C".to_string(),
            bracket_floor: Some(13.0),
            bracket_ceiling: Some(13.0),
            tier: "FLOOR_NO_CERTAIN".to_string(),
            question: "Will the high be 13°C?".to_string(),
            side: Side::No,
            entry_price: 0.70,
            shares: 100.0 / 0.70,
            cost: 100.0,
            opened_at: Utc::now(),
            closed_at: None,
            outcome: None,
            pnl: None,
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn test_open_and_read_back() {
        let mut store = PositionStore::in_memory().unwrap();
        store.open_position(&sample("k1"), 900.0, "opened k1").unwrap();

        let pos = store.position("k1").unwrap().unwrap();
        assert_eq!(pos.bracket, "13C");
        assert_eq!(pos.side, Side::No);
        assert!(pos.is_open());
        assert!(store.position("k2").unwrap().is_none());
        assert!(store.exists("k1").unwrap());
    }

    #[test]
    fn test_open_records_balance_in_same_transaction() {
        let mut store = PositionStore::in_memory().unwrap();
        store.open_position(&sample("k1"), 900.0, "opened k1").unwrap();

        let history = store.balance_history().unwrap();
        assert_eq!(history.len(), 1);
        assert!((history[0].balance - 900.0).abs() < 1e-9);
        assert_eq!(history[0].note, "opened k1");
        assert_eq!(store.latest_balance().unwrap(), Some(900.0));
    }

    #[test]
    fn test_duplicate_open_rolls_back_balance_row() {
        let mut store = PositionStore::in_memory().unwrap();
        store.open_position(&sample("k1"), 900.0, "opened k1").unwrap();
        assert!(store.open_position(&sample("k1"), 800.0, "opened k1").is_err());
        // The rejected insert must not leave a stray balance row behind
        assert_eq!(store.balance_history().unwrap().len(), 1);
        assert_eq!(store.latest_balance().unwrap(), Some(900.0));
    }

    #[test]
    fn test_close_updates_position_and_balance_atomically() {
        let mut store = PositionStore::in_memory().unwrap();
        store.open_position(&sample("k1"), 900.0, "opened k1").unwrap();
        store
            .close_position("k1", Outcome::Win, 42.86, 942.86, "resolved 13C WIN")
            .unwrap();

        let pos = store.position("k1").unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.outcome, Some(Outcome::Win));
        assert!(pos.closed_at.is_some());
        assert!((pos.pnl.unwrap() - 42.86).abs() < 1e-9);

        let history = store.balance_history().unwrap();
        assert_eq!(history.len(), 2);
        assert!((history[1].balance - 942.86).abs() < 1e-9);
    }

    #[test]
    fn test_open_positions_filtered_by_date() {
        let mut store = PositionStore::in_memory().unwrap();
        let mut other_day = sample("k2");
        other_day.date = NaiveDate::from_ymd_opt(2026, 2, 23).unwrap();
        store.open_position(&sample("k1"), 900.0, "opened k1").unwrap();
        store.open_position(&other_day, 800.0, "opened k2").unwrap();
        store
            .close_position("k1", Outcome::Loss, -100.0, 800.0, "resolved")
            .unwrap();

        let d22 = NaiveDate::from_ymd_opt(2026, 2, 22).unwrap();
        let d23 = NaiveDate::from_ymd_opt(2026, 2, 23).unwrap();
        assert!(store.open_positions_for_date(d22).unwrap().is_empty());
        assert_eq!(store.closed_positions_for_date(d22).unwrap().len(), 1);
        assert_eq!(store.open_positions_for_date(d23).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_balance_for_restart() {
        let store = PositionStore::in_memory().unwrap();
        assert!(store.latest_balance().unwrap().is_none());

        store.record_balance(1000.0, "start").unwrap();
        store.record_balance(900.0, "opened k1").unwrap();
        assert_eq!(store.latest_balance().unwrap(), Some(900.0));
    }
}
