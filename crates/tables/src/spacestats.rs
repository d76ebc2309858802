//! Per-space daily egress counters.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::params;

use tollgate_identity::Did;

use crate::{Db, Result, TableError};

#[derive(Debug, Clone, PartialEq)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub egress: u64,
}

#[async_trait]
pub trait SpaceStatsTable: Send + Sync {
    /// Atomically add `egress` to the `(space, today-UTC)` counter.
    ///
    /// The underlying primitive must be an atomic add, never a
    /// read-modify-write. The counters carry no idempotency key: a
    /// consolidation replay after a crash before the batch was marked
    /// processed can double-count here. That is a documented limit of
    /// these display-oriented counters; the per-node consolidated
    /// totals are protected separately by conditional inserts.
    async fn record(&self, space: &Did, egress: u64) -> Result<()>;

    /// Daily counters for `space` in the inclusive `[from, to]` range.
    /// Days with no recorded egress are absent from the result.
    async fn get_daily_stats(
        &self,
        space: &Did,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStat>>;
}

/// SQLite reference adapter. The increment is a single
/// `INSERT … ON CONFLICT … SET egress = egress + excluded.egress`
/// statement, which SQLite executes atomically.
pub struct SqliteSpaceStatsTable {
    db: Db,
    table: String,
}

impl SqliteSpaceStatsTable {
    pub fn new(db: Db, table: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    space TEXT NOT NULL,
                    day TEXT NOT NULL,
                    egress INTEGER NOT NULL,
                    PRIMARY KEY (space, day)
                );"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl SpaceStatsTable for SqliteSpaceStatsTable {
    async fn record(&self, space: &Did, egress: u64) -> Result<()> {
        let day = Utc::now().date_naive().to_string();
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (space, day, egress) VALUES (?1, ?2, ?3)
                     ON CONFLICT(space, day) DO UPDATE SET egress = egress + excluded.egress",
                    self.table
                ),
                params![space.to_string(), day, egress as i64],
            )
            .map(|_| ())
        })
    }

    async fn get_daily_stats(
        &self,
        space: &Did,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT day, egress FROM {}
                 WHERE space = ?1 AND day >= ?2 AND day <= ?3
                 ORDER BY day",
                self.table
            ))?;
            let rows = stmt
                .query_map(
                    params![space.to_string(), from.to_string(), to.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(day, egress)| {
                Ok(DailyStat {
                    date: day
                        .parse()
                        .map_err(|e| TableError::Corrupt(format!("day: {e}")))?,
                    egress: egress as u64,
                })
            })
            .collect()
    }
}
