//! Customer directory: existence checks and paginated listing.

use async_trait::async_trait;
use rusqlite::params;

use tollgate_identity::Did;

use crate::{Db, Result, TableError};

#[derive(Debug, Clone, Default)]
pub struct CustomerPage {
    pub customers: Vec<Did>,
    /// Opaque continuation token; absent on the last page.
    pub cursor: Option<String>,
}

#[async_trait]
pub trait CustomerTable: Send + Sync {
    async fn has(&self, customer: &Did) -> Result<bool>;

    /// Scan with an opaque token. No stable ordering is promised;
    /// consumers must not rely on order across pages.
    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<CustomerPage>;
}

/// SQLite reference adapter; the opaque cursor is a rowid.
pub struct SqliteCustomerTable {
    db: Db,
    table: String,
}

impl SqliteCustomerTable {
    pub fn new(db: Db, table: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    customer TEXT PRIMARY KEY
                );"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    /// Seed a customer row; used by mirroring deployments and tests.
    pub fn put(&self, customer: &Did) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                &format!("INSERT OR IGNORE INTO {} (customer) VALUES (?1)", self.table),
                params![customer.to_string()],
            )
            .map(|_| ())
        })
    }
}

#[async_trait]
impl CustomerTable for SqliteCustomerTable {
    async fn has(&self, customer: &Did) -> Result<bool> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE customer = ?1", self.table),
                params![customer.to_string()],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    async fn list(&self, limit: usize, cursor: Option<&str>) -> Result<CustomerPage> {
        let after: i64 = match cursor {
            Some(token) => token
                .parse()
                .map_err(|_| TableError::Corrupt(format!("invalid cursor '{token}'")))?,
            None => 0,
        };

        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT rowid, customer FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                self.table
            ))?;
            let rows = stmt
                .query_map(params![after, limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let cursor = if rows.len() == limit {
            rows.last().map(|(rowid, _)| rowid.to_string())
        } else {
            None
        };
        let customers = rows
            .iter()
            .map(|(_, s)| {
                s.parse()
                    .map_err(|e| TableError::Corrupt(format!("customer did: {e}")))
            })
            .collect::<Result<Vec<Did>>>()?;

        Ok(CustomerPage { customers, cursor })
    }
}
