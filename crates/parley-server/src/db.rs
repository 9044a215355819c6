//! Async access to the synchronous SQLite store.
//!
//! rusqlite is blocking, so every call runs on tokio's blocking pool while
//! holding the single connection's lock.

use std::path::Path;
use std::sync::{Arc, Mutex};

use parley_store::rusqlite::{Connection, Transaction};
use parley_store::Database;

use crate::error::ServerError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, ServerError> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self, ServerError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` against the connection outside of an explicit transaction.
    pub async fn call<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| ServerError::Internal("database lock poisoned".into()))?;
            f(guard.conn())
        })
        .await
        .map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }

    /// Run `f` inside one transaction. Any error rolls every write back.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| ServerError::Internal("database lock poisoned".into()))?;
            guard.transaction(f)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("database task failed: {e}")))?
    }
}

#[cfg(test)]
impl Store {
    /// Number of rows in `table`.
    pub async fn count_rows(&self, table: &'static str) -> i64 {
        self.call(move |conn| {
            Ok(conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .map_err(parley_store::StoreError::from)?)
        })
        .await
        .unwrap()
    }
}
