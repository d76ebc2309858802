//! The egress table: a durable queue of unprocessed track batches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;

use tollgate_capability::{Cid, Invocation};
use tollgate_identity::Did;

use crate::{Db, Result, TableError};

/// One submitted batch of retrieval receipts.
#[derive(Debug, Clone)]
pub struct EgressRecord {
    /// Content id of the receipt bundle; primary key.
    pub batch: Cid,
    /// The storage node that submitted the batch.
    pub node: Did,
    /// URL pattern with a `{cid}` placeholder for fetching the bundle.
    pub endpoint: String,
    /// The track invocation that created this record.
    pub cause: Invocation,
    pub received_at: DateTime<Utc>,
    /// Present iff the batch has not been consolidated yet.
    pub unprocessed_since: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EgressTable: Send + Sync {
    /// Unconditional insert; a resubmitted batch overwrites its record.
    async fn record(&self, batch: Cid, node: &Did, endpoint: &str, cause: &Invocation)
        -> Result<()>;

    /// Up to `limit` records still carrying the unprocessed marker.
    /// No ordering is guaranteed.
    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<EgressRecord>>;

    /// Remove the unprocessed marker, best-effort per record. Repeating
    /// the operation on an already-processed record is a no-op success.
    async fn mark_as_processed(&self, records: &[EgressRecord]) -> Result<()>;

    /// Snapshot of the queue depth, for metrics.
    async fn count_unprocessed(&self) -> Result<i64>;
}

/// SQLite reference adapter. The unprocessed scan goes through a sparse
/// partial index over `unprocessed_since`.
pub struct SqliteEgressTable {
    db: Db,
    table: String,
}

impl SqliteEgressTable {
    pub fn new(db: Db, table: &str, unprocessed_index: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    batch TEXT PRIMARY KEY,
                    node TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    cause BLOB NOT NULL,
                    received_at TEXT NOT NULL,
                    unprocessed_since TEXT
                );
                CREATE INDEX IF NOT EXISTS {unprocessed_index}
                    ON {table}(unprocessed_since)
                    WHERE unprocessed_since IS NOT NULL;"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            batch: row.get(0)?,
            node: row.get(1)?,
            endpoint: row.get(2)?,
            cause: row.get(3)?,
            received_at: row.get(4)?,
            unprocessed_since: row.get(5)?,
        })
    }
}

struct RawRow {
    batch: String,
    node: String,
    endpoint: String,
    cause: Vec<u8>,
    received_at: String,
    unprocessed_since: Option<String>,
}

impl RawRow {
    fn parse(self) -> Result<EgressRecord> {
        let batch = self
            .batch
            .parse()
            .map_err(|e| TableError::Corrupt(format!("batch cid: {e}")))?;
        let node = self
            .node
            .parse()
            .map_err(|e| TableError::Corrupt(format!("node did: {e}")))?;
        let cause = Invocation::extract(&self.cause)
            .map_err(|e| TableError::Corrupt(format!("cause archive: {e}")))?;
        let received_at = parse_rfc3339(&self.received_at)?;
        let unprocessed_since = self
            .unprocessed_since
            .as_deref()
            .map(parse_rfc3339)
            .transpose()?;
        Ok(EgressRecord {
            batch,
            node,
            endpoint: self.endpoint,
            cause,
            received_at,
            unprocessed_since,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TableError::Corrupt(format!("timestamp: {e}")))
}

#[async_trait]
impl EgressTable for SqliteEgressTable {
    async fn record(
        &self,
        batch: Cid,
        node: &Did,
        endpoint: &str,
        cause: &Invocation,
    ) -> Result<()> {
        let archive = cause
            .archive()
            .map_err(|e| TableError::Corrupt(format!("cause archive: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {}
                     (batch, node, endpoint, cause, received_at, unprocessed_since)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    self.table
                ),
                params![batch.to_string(), node.to_string(), endpoint, archive, now],
            )
            .map(|_| ())
        })
    }

    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<EgressRecord>> {
        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT batch, node, endpoint, cause, received_at, unprocessed_since
                 FROM {} WHERE unprocessed_since IS NOT NULL LIMIT ?1",
                self.table
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], Self::row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawRow::parse).collect()
    }

    async fn mark_as_processed(&self, records: &[EgressRecord]) -> Result<()> {
        let mut failures = 0usize;
        for record in records {
            let result = self.db.with(|conn| {
                conn.execute(
                    &format!(
                        "UPDATE {} SET unprocessed_since = NULL WHERE batch = ?1",
                        self.table
                    ),
                    params![record.batch.to_string()],
                )
                .map(|_| ())
            });
            if let Err(e) = result {
                tracing::error!(batch = %record.batch, error = %e, "failed to mark record as processed");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(TableError::Storage(format!(
                "{failures} of {} records could not be marked processed",
                records.len()
            )));
        }
        Ok(())
    }

    async fn count_unprocessed(&self) -> Result<i64> {
        self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE unprocessed_since IS NOT NULL",
                    self.table
                ),
                [],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_capability::{abilities, invoke, Capability, Codec};
    use tollgate_identity::Identity;

    fn table() -> SqliteEgressTable {
        SqliteEgressTable::new(Db::open_in_memory().unwrap(), "egress", "egress_unprocessed")
            .unwrap()
    }

    fn track_invocation(node: &Identity, service: &Identity, batch: Cid) -> Invocation {
        let cap = Capability::new(
            abilities::TRACK,
            service.did().clone(),
            &abilities::TrackCaveats {
                receipts: batch,
                endpoint: "https://node.example/batches/{cid}".into(),
            },
        )
        .unwrap();
        invoke(node, service.did(), cap, vec![]).unwrap()
    }

    #[tokio::test]
    async fn record_and_drain() {
        let t = table();
        let node = Identity::generate();
        let service = Identity::generate();
        let batch = Cid::of(Codec::Raw, b"bundle-1");
        let inv = track_invocation(&node, &service, batch);

        t.record(batch, node.did(), "https://node.example/batches/{cid}", &inv)
            .await
            .unwrap();

        assert_eq!(t.count_unprocessed().await.unwrap(), 1);

        let records = t.get_unprocessed(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].batch, batch);
        assert_eq!(&records[0].node, node.did());
        assert_eq!(records[0].cause.link(), inv.link());
        assert!(records[0].unprocessed_since.is_some());

        t.mark_as_processed(&records).await.unwrap();
        assert_eq!(t.count_unprocessed().await.unwrap(), 0);
        assert!(t.get_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resubmitted_batch_overwrites() {
        let t = table();
        let node = Identity::generate();
        let service = Identity::generate();
        let batch = Cid::of(Codec::Raw, b"bundle-dup");

        let inv1 = track_invocation(&node, &service, batch);
        let inv2 = track_invocation(&node, &service, batch);
        t.record(batch, node.did(), "https://a.example/{cid}", &inv1)
            .await
            .unwrap();
        t.record(batch, node.did(), "https://b.example/{cid}", &inv2)
            .await
            .unwrap();

        let records = t.get_unprocessed(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "https://b.example/{cid}");
        assert_eq!(records[0].cause.link(), inv2.link());
    }

    #[tokio::test]
    async fn mark_as_processed_is_idempotent() {
        let t = table();
        let node = Identity::generate();
        let service = Identity::generate();
        let batch = Cid::of(Codec::Raw, b"bundle-2");
        let inv = track_invocation(&node, &service, batch);
        t.record(batch, node.did(), "https://n.example/{cid}", &inv)
            .await
            .unwrap();

        let records = t.get_unprocessed(10).await.unwrap();
        t.mark_as_processed(&records).await.unwrap();
        // Second pass over the same records is a no-op success.
        t.mark_as_processed(&records).await.unwrap();
        assert_eq!(t.count_unprocessed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn limit_is_honored() {
        let t = table();
        let node = Identity::generate();
        let service = Identity::generate();
        for i in 0..5u8 {
            let batch = Cid::of(Codec::Raw, &[i]);
            let inv = track_invocation(&node, &service, batch);
            t.record(batch, node.did(), "https://n.example/{cid}", &inv)
                .await
                .unwrap();
        }
        assert_eq!(t.get_unprocessed(3).await.unwrap().len(), 3);
        assert_eq!(t.count_unprocessed().await.unwrap(), 5);
    }
}
