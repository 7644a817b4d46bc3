//! Transaction support for SQLite backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::Value;
use tracing::debug;

use crate::core::{Transaction, TransactionProvider};
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::types::{ResourceMethod, StoredResource};

use super::SqliteBackend;
use super::backend::rollback;

/// A SQLite transaction.
///
/// Holds one pooled connection with an open `BEGIN IMMEDIATE` transaction.
/// With an in-memory database that is the only connection, so other
/// callers wait until this transaction ends.
pub struct SqliteTransaction {
    /// The connection used for this transaction.
    conn: Mutex<PooledConnection<SqliteConnectionManager>>,
    backend: SqliteBackend,
    /// Whether the transaction is still active.
    active: bool,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SqliteTransaction {
    fn new(
        backend: SqliteBackend,
        conn: PooledConnection<SqliteConnectionManager>,
    ) -> StorageResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            StorageError::Transaction(TransactionError::RolledBack {
                reason: format!("Failed to begin transaction: {}", e),
            })
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
            backend,
            active: true,
        })
    }

    fn ensure_active(&self) -> StorageResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(StorageError::Transaction(TransactionError::InvalidTransaction))
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn create(
        &mut self,
        resource_type: &str,
        resource: Value,
    ) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend.create_in(&conn, resource_type, resource)
    }

    async fn read(
        &mut self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend.read_in(&conn, resource_type, id)
    }

    async fn update(
        &mut self,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend
            .update_in(&conn, resource_type, id, resource, if_match, ResourceMethod::Put)
    }

    async fn delete(&mut self, resource_type: &str, id: &str) -> StorageResult<()> {
        self.ensure_active()?;
        let conn = self.conn.lock();
        self.backend.delete_in(&conn, resource_type, id)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        self.ensure_active()?;
        let result = {
            let conn = self.conn.lock();
            conn.execute_batch("COMMIT").map_err(|e| {
                rollback(&conn);
                StorageError::Transaction(TransactionError::RolledBack {
                    reason: format!("Commit failed: {}", e),
                })
            })
        };
        self.active = false;
        debug!(committed = result.is_ok(), "Transaction finished");
        result
    }

    async fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        self.ensure_active()?;
        {
            let conn = self.conn.lock();
            conn.execute_batch("ROLLBACK")?;
        }
        self.active = false;
        debug!("Transaction rolled back");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // If transaction wasn't explicitly committed or rolled back, roll it back
        if self.active {
            let conn = self.conn.lock();
            rollback(&conn);
        }
    }
}

#[async_trait]
impl TransactionProvider for SqliteBackend {
    type Transaction = SqliteTransaction;

    async fn begin_transaction(&self) -> StorageResult<Self::Transaction> {
        let conn = self.get_connection()?;
        SqliteTransaction::new(self.clone(), conn)
    }
}
