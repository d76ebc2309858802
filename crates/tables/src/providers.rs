//! Registered storage-node directory.

use async_trait::async_trait;
use rusqlite::params;

use tollgate_identity::Did;

use crate::{Db, Result, TableError};

#[derive(Debug, Clone, PartialEq)]
pub struct StorageProviderRecord {
    pub provider: Did,
    pub email: String,
    pub endpoint: String,
    pub wallet: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderPage {
    pub records: Vec<StorageProviderRecord>,
    /// Opaque continuation token; absent on the last page.
    pub cursor: Option<String>,
}

#[async_trait]
pub trait StorageProviderTable: Send + Sync {
    async fn get(&self, provider: &Did) -> Result<StorageProviderRecord>;

    /// Scan with an opaque token; no stable ordering is promised.
    async fn get_all(&self, limit: usize, cursor: Option<&str>) -> Result<ProviderPage>;
}

/// SQLite reference adapter; the opaque cursor is a rowid.
pub struct SqliteStorageProviderTable {
    db: Db,
    table: String,
}

impl SqliteStorageProviderTable {
    pub fn new(db: Db, table: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    provider TEXT PRIMARY KEY,
                    email TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    wallet TEXT NOT NULL
                );"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    /// Seed a provider row; used by mirroring deployments and tests.
    pub fn put(&self, record: &StorageProviderRecord) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (provider, email, endpoint, wallet)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                params![
                    record.provider.to_string(),
                    record.email,
                    record.endpoint,
                    record.wallet
                ],
            )
            .map(|_| ())
        })
    }

    fn parse(raw: (String, String, String, String)) -> Result<StorageProviderRecord> {
        let (provider, email, endpoint, wallet) = raw;
        Ok(StorageProviderRecord {
            provider: provider
                .parse()
                .map_err(|e| TableError::Corrupt(format!("provider did: {e}")))?,
            email,
            endpoint,
            wallet,
        })
    }
}

#[async_trait]
impl StorageProviderTable for SqliteStorageProviderTable {
    async fn get(&self, provider: &Did) -> Result<StorageProviderRecord> {
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT provider, email, endpoint, wallet FROM {} WHERE provider = ?1",
                self.table
            ))?;
            let mut rows = stmt
                .query_map(params![provider.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows.pop())
        })?;
        Self::parse(raw.ok_or(TableError::NotFound)?)
    }

    async fn get_all(&self, limit: usize, cursor: Option<&str>) -> Result<ProviderPage> {
        let after: i64 = match cursor {
            Some(token) => token
                .parse()
                .map_err(|_| TableError::Corrupt(format!("invalid cursor '{token}'")))?,
            None => 0,
        };

        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT rowid, provider, email, endpoint, wallet FROM {}
                 WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                self.table
            ))?;
            let rows = stmt
                .query_map(params![after, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        (
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ),
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let cursor = if rows.len() == limit {
            rows.last().map(|(rowid, _)| rowid.to_string())
        } else {
            None
        };
        let records = rows
            .into_iter()
            .map(|(_, raw)| Self::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(ProviderPage { records, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_identity::Identity;

    fn table() -> SqliteStorageProviderTable {
        SqliteStorageProviderTable::new(Db::open_in_memory().unwrap(), "storage_providers").unwrap()
    }

    fn record(provider: &Identity) -> StorageProviderRecord {
        StorageProviderRecord {
            provider: provider.did().clone(),
            email: "ops@node.example".into(),
            endpoint: "https://node.example".into(),
            wallet: "wallet-1".into(),
        }
    }

    #[tokio::test]
    async fn get_roundtrip() {
        let t = table();
        let provider = Identity::generate();
        t.put(&record(&provider)).unwrap();

        let got = t.get(provider.did()).await.unwrap();
        assert_eq!(got, record(&provider));
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let t = table();
        let provider = Identity::generate();
        assert!(matches!(t.get(provider.did()).await, Err(TableError::NotFound)));
    }

    #[tokio::test]
    async fn pagination_terminates() {
        let t = table();
        for _ in 0..5 {
            t.put(&record(&Identity::generate())).unwrap();
        }

        let mut total = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = t.get_all(2, cursor.as_deref()).await.unwrap();
            total += page.records.len();
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(total, 5);
    }
}
