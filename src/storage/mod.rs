#![forbid(unsafe_code)]

//! SQLite-backed node table and asset↔node membership relation.
//!
//! The store is a shared, multi-writer resource: every caller goes through
//! one connection guarded by a mutex, and each engine operation runs its
//! reads and writes inside a single immediate transaction so that counting
//! always sees current membership state.

mod memberships;
mod nodes;
mod schema;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::config::TreeOptions;
use crate::types::Result;

pub(crate) use memberships::*;
pub(crate) use nodes::*;

/// Handle to the persisted tree.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Opens (creating if needed) a database file and applies the schema.
    pub fn open(path: impl AsRef<Path>, opts: &TreeOptions) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(opts.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        debug!(path = ?path, "tree.store.opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` against the connection without opening a transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction; commits on `Ok`, rolls back
    /// on `Err`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Encodes ids as a JSON array for `json_each` filters.
pub(crate) fn json_ids<T: serde::Serialize>(ids: &[T]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}
