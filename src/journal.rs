//! SQLite journal of closed live trades

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::types::{Side, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: Symbol,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub ror: f64,
    pub pnl: f64,
    pub reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Account balance after the close; `None` when it could not be queried
    pub balance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JournalSummary {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: f64,
}

pub struct TradeJournal {
    conn: Mutex<Connection>,
}

impl TradeJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                ror REAL NOT NULL,
                pnl REAL NOT NULL,
                reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                balance REAL
            )",
            [],
        )?;
        Ok(TradeJournal {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("journal lock poisoned"))
    }

    pub fn record(&self, trade: &ClosedTrade) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO closed_trades (
                symbol, side, size, entry_price, exit_price, ror, pnl, reason,
                opened_at, closed_at, balance
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.symbol.as_str(),
                trade.side.to_string(),
                trade.size,
                trade.entry_price,
                trade.exit_price,
                trade.ror,
                trade.pnl,
                trade.reason,
                trade.opened_at.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
                trade.balance,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "Trade journaled: {} {} ROR {:+.2}% PnL {:.2} ({})",
            trade.side, trade.symbol, trade.ror, trade.pnl, trade.reason
        );
        Ok(id)
    }

    /// Most recent trades first
    pub fn recent(&self, limit: usize) -> Result<Vec<ClosedTrade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, side, size, entry_price, exit_price, ror, pnl, reason,
                    opened_at, closed_at, balance
             FROM closed_trades ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<f64>>(10)?,
            ))
        })?;

        let mut trades = Vec::new();
        for row in rows {
            let (symbol, side, size, entry_price, exit_price, ror, pnl, reason, opened, closed, balance) =
                row?;
            trades.push(ClosedTrade {
                symbol: Symbol::new(symbol),
                side: match side.as_str() {
                    "short" => Side::Short,
                    _ => Side::Long,
                },
                size,
                entry_price,
                exit_price,
                ror,
                pnl,
                reason,
                opened_at: parse_time(&opened)?,
                closed_at: parse_time(&closed)?,
                balance,
            });
        }
        Ok(trades)
    }

    pub fn summary(&self) -> Result<JournalSummary> {
        let conn = self.conn()?;
        let (trades, wins, total_pnl) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(pnl > 0), 0), COALESCE(SUM(pnl), 0.0) FROM closed_trades",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?)),
        )?;
        Ok(JournalSummary {
            trades: trades as usize,
            wins: wins as usize,
            total_pnl,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Bad timestamp in journal: {}", s))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn trade(symbol: &str, pnl: f64) -> ClosedTrade {
        let closed_at = Utc::now();
        ClosedTrade {
            symbol: Symbol::new(symbol),
            side: Side::Short,
            size: 1.5,
            entry_price: 100.0,
            exit_price: 96.0,
            ror: pnl / 10.0,
            pnl,
            reason: "trailing stop".to_string(),
            opened_at: closed_at - Duration::hours(12),
            closed_at,
            balance: Some(1000.0 + pnl),
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let journal = TradeJournal::in_memory().unwrap();
        journal.record(&trade("ETHUSDT", 6.0)).unwrap();
        journal.record(&trade("SOLUSDT", -3.0)).unwrap();

        let recent = journal.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].symbol.as_str(), "SOLUSDT");
        assert_eq!(recent[0].side, Side::Short);
        assert_eq!(recent[1].reason, "trailing stop");

        let summary = journal.summary().unwrap();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.wins, 1);
        assert!((summary.total_pnl - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_file_journal_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("trades.db");
        {
            let journal = TradeJournal::open(&path).unwrap();
            journal.record(&trade("BTCUSDT", 1.0)).unwrap();
        }
        let journal = TradeJournal::open(&path).unwrap();
        assert_eq!(journal.summary().unwrap().trades, 1);
    }

    #[test]
    fn test_unknown_balance_is_stored_as_null() {
        let journal = TradeJournal::in_memory().unwrap();
        let mut record = trade("ETHUSDT", 2.0);
        record.balance = None;
        journal.record(&record).unwrap();

        let recent = journal.recent(1).unwrap();
        assert_eq!(recent[0].balance, None);
        let nulls: i64 = journal
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM closed_trades WHERE balance IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_empty_summary() {
        let journal = TradeJournal::in_memory().unwrap();
        assert_eq!(journal.summary().unwrap(), JournalSummary::default());
    }
}
