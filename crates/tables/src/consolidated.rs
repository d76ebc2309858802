//! The consolidated table: one signed consolidation result per drained
//! batch, keyed by the consolidate-invocation id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;

use tollgate_capability::Cid;
use tollgate_identity::Did;

use crate::{Db, Result, TableError};

#[derive(Debug, Clone)]
pub struct ConsolidatedRecord {
    /// The consolidate-invocation id; primary key.
    pub cause: Cid,
    pub node: Did,
    pub total_egress: u64,
    /// The signed consolidation receipt as its canonical archive.
    pub receipt: Vec<u8>,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConsolidatedTable: Send + Sync {
    /// Conditional insert: fails with [`TableError::AlreadyExists`] if a
    /// record for `cause` is present, so retries cannot duplicate.
    async fn add(&self, cause: Cid, node: &Did, total_egress: u64, receipt: &[u8]) -> Result<()>;

    async fn get(&self, cause: &Cid) -> Result<ConsolidatedRecord>;

    /// Records for `node` with `processed_at >= since`, via the
    /// `(node, processed_at)` secondary index.
    async fn get_stats_by_node(
        &self,
        node: &Did,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConsolidatedRecord>>;
}

/// SQLite reference adapter.
pub struct SqliteConsolidatedTable {
    db: Db,
    table: String,
}

impl SqliteConsolidatedTable {
    pub fn new(db: Db, table: &str, node_stats_index: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    cause TEXT PRIMARY KEY,
                    node TEXT NOT NULL,
                    total_egress INTEGER NOT NULL,
                    receipt BLOB NOT NULL,
                    processed_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {node_stats_index}
                    ON {table}(node, processed_at);"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, Vec<u8>, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn to_record(raw: (String, String, i64, Vec<u8>, String)) -> Result<ConsolidatedRecord> {
        let (cause, node, total, receipt, processed_at) = raw;
        Ok(ConsolidatedRecord {
            cause: cause
                .parse()
                .map_err(|e| TableError::Corrupt(format!("cause cid: {e}")))?,
            node: node
                .parse()
                .map_err(|e| TableError::Corrupt(format!("node did: {e}")))?,
            total_egress: total as u64,
            receipt,
            processed_at: DateTime::parse_from_rfc3339(&processed_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| TableError::Corrupt(format!("processed_at: {e}")))?,
        })
    }
}

#[async_trait]
impl ConsolidatedTable for SqliteConsolidatedTable {
    async fn add(&self, cause: Cid, node: &Did, total_egress: u64, receipt: &[u8]) -> Result<()> {
        let changed = self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {}
                     (cause, node, total_egress, receipt, processed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.table
                ),
                params![
                    cause.to_string(),
                    node.to_string(),
                    total_egress as i64,
                    receipt,
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
        if changed == 0 {
            return Err(TableError::AlreadyExists);
        }
        Ok(())
    }

    async fn get(&self, cause: &Cid) -> Result<ConsolidatedRecord> {
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT cause, node, total_egress, receipt, processed_at
                 FROM {} WHERE cause = ?1",
                self.table
            ))?;
            let mut rows = stmt
                .query_map(params![cause.to_string()], Self::parse_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.pop())
        })?;
        match raw {
            Some(raw) => Self::to_record(raw),
            None => Err(TableError::NotFound),
        }
    }

    async fn get_stats_by_node(
        &self,
        node: &Did,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConsolidatedRecord>> {
        let raws = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT cause, node, total_egress, receipt, processed_at
                 FROM {} WHERE node = ?1 AND processed_at >= ?2
                 ORDER BY processed_at",
                self.table
            ))?;
            let rows = stmt
                .query_map(
                    params![node.to_string(), since.to_rfc3339()],
                    Self::parse_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        raws.into_iter().map(Self::to_record).collect()
    }
}
