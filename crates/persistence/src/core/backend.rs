//! Backend abstraction for database drivers.
//!
//! A [`Backend`] owns the connection pool and schema of one relational store.
//! The storage, search and bundle traits in this module tree are implemented
//! on top of it.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::BackendError;

/// Identifies the type of database backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// SQLite database (file-based or in-memory).
    Sqlite,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendPoolStats {
    /// Connections currently open.
    pub connections: u32,
    /// Connections idle in the pool.
    pub idle_connections: u32,
    /// Configured maximum.
    pub max_connections: u32,
}

/// A database backend.
#[async_trait]
pub trait Backend: Send + Sync + Debug {
    /// Returns the backend kind.
    fn kind(&self) -> BackendKind;

    /// Returns a short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Creates or migrates the schema.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Checks that the store answers queries.
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Returns pool statistics.
    fn pool_stats(&self) -> BackendPoolStats;
}
