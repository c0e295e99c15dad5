//! Fact Store
//!
//! SQLite persistence for entities, redemption state, the audit log and the
//! target-anomaly queue. A single connection sits behind a mutex; every
//! engine call holds it for one `BEGIN IMMEDIATE` transaction, so the
//! read-decide-write sequence for an entity can never interleave with
//! another writer, in this process or any other sharing the file.

pub mod anomalies;
pub mod entities;
pub mod history;
pub mod schema;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use anomalies::AnomalyLog;
pub use history::AuditLog;

/// How long a writer waits on another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct FactStore {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl FactStore {
    /// Open or create a store on disk and run migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let mut conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.execute_batch(schema::PRAGMAS_SQL)
            .context("Failed to apply pragmas")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        schema::migrate(&mut conn).context("Failed to migrate schema")?;

        info!(path = %db_path, "Fact store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_string(),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: ":memory:".to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` inside one immediate transaction. Commits on `Ok`, rolls back
    /// on `Err` (the transaction is dropped without commit).
    pub fn with_transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transaction")?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    /// Read-only access outside a write transaction.
    pub fn read<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Onboard a ticker. Idempotent; returns whether a row was created.
    pub fn insert_entity(&self, ticker: &str) -> Result<bool> {
        self.with_transaction(|tx| entities::insert(tx, ticker))
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("facts.db");
        let path = path.to_str().unwrap();

        let store = FactStore::open(path).unwrap();
        assert!(store.insert_entity("ACME").unwrap());
        drop(store);

        let store = FactStore::open(path).unwrap();
        assert!(!store.insert_entity("ACME").unwrap());
        let entity = store.read(|c| entities::load(c, "ACME")).unwrap();
        assert!(entity.is_some());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = FactStore::open_memory().unwrap();
        let result: Result<()> = store.with_transaction(|tx| {
            entities::insert(tx, "ACME")?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        let entity = store.read(|c| entities::load(c, "ACME")).unwrap();
        assert!(entity.is_none());
    }
}
