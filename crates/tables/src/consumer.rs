//! Consumer table: which provider serves a space, and which customer
//! pays for it. Populated by the upload service; read-only here.

use async_trait::async_trait;
use rusqlite::params;

use tollgate_identity::Did;

use crate::{Db, Result, TableError};

#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub space: Did,
    pub provider: Did,
    pub customer: Did,
    pub subscription: String,
}

#[async_trait]
pub trait ConsumerTable: Send + Sync {
    async fn get(&self, space: &Did) -> Result<Consumer>;

    /// All spaces owned by `customer`.
    async fn list_by_customer(&self, customer: &Did) -> Result<Vec<Did>>;
}

/// SQLite reference adapter with a secondary index on the customer.
pub struct SqliteConsumerTable {
    db: Db,
    table: String,
}

impl SqliteConsumerTable {
    pub fn new(db: Db, table: &str, customer_index: &str) -> Result<Self> {
        db.with(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    space TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    customer TEXT NOT NULL,
                    subscription TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS {customer_index} ON {table}(customer);"
            ))
        })?;
        Ok(Self {
            db,
            table: table.to_string(),
        })
    }

    /// Seed a consumer row; used by deployments that mirror the upload
    /// service's table locally, and by tests.
    pub fn put(&self, consumer: &Consumer) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (space, provider, customer, subscription)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                params![
                    consumer.space.to_string(),
                    consumer.provider.to_string(),
                    consumer.customer.to_string(),
                    consumer.subscription
                ],
            )
            .map(|_| ())
        })
    }
}

fn parse_did(s: &str, what: &str) -> Result<Did> {
    s.parse()
        .map_err(|e| TableError::Corrupt(format!("{what}: {e}")))
}

#[async_trait]
impl ConsumerTable for SqliteConsumerTable {
    async fn get(&self, space: &Did) -> Result<Consumer> {
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT space, provider, customer, subscription FROM {} WHERE space = ?1",
                self.table
            ))?;
            let mut rows = stmt
                .query_map(params![space.to_string()], |row| {
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

        let (space, provider, customer, subscription) = raw.ok_or(TableError::NotFound)?;
        Ok(Consumer {
            space: parse_did(&space, "space did")?,
            provider: parse_did(&provider, "provider did")?,
            customer: parse_did(&customer, "customer did")?,
            subscription,
        })
    }

    async fn list_by_customer(&self, customer: &Did) -> Result<Vec<Did>> {
        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT space FROM {} WHERE customer = ?1",
                self.table
            ))?;
            let rows = stmt
                .query_map(params![customer.to_string()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.iter().map(|s| parse_did(s, "space did")).collect()
    }
}
