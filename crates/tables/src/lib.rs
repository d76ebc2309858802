//! Tollgate Tables
//!
//! Durable table interfaces for the egress accounting service, plus the
//! SQLite reference adapters. The traits specify operation signatures
//! and ordering guarantees only; production deployments may substitute
//! any backend that honors them.

pub mod consolidated;
pub mod consumer;
pub mod customer;
pub mod egress;
pub mod providers;
pub mod spacestats;

pub use consolidated::{ConsolidatedRecord, ConsolidatedTable, SqliteConsolidatedTable};
pub use consumer::{Consumer, ConsumerTable, SqliteConsumerTable};
pub use customer::{CustomerPage, CustomerTable, SqliteCustomerTable};
pub use egress::{EgressRecord, EgressTable, SqliteEgressTable};
pub use providers::{ProviderPage, SqliteStorageProviderTable, StorageProviderRecord, StorageProviderTable};
pub use spacestats::{DailyStat, SpaceStatsTable, SqliteSpaceStatsTable};

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("record already exists")]
    AlreadyExists,
    #[error("record not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for TableError {
    fn from(e: rusqlite::Error) -> Self {
        TableError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Shared handle to the SQLite database backing the reference adapters.
///
/// SQLite work is fast and short; a single mutex-guarded connection
/// keeps the adapters trivially `Send + Sync` and serializes the
/// atomic-increment traffic the same way the consolidation loop does.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}
