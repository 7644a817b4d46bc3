//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::{EngineConfig, SearchConfig, SqliteBackendConfig};
use crate::core::{Backend, BackendKind, BackendPoolStats};
use crate::error::{BackendError, StorageError, StorageResult};
use crate::search::{SearchParameterExtractor, SearchParameterRegistry};
use crate::version::VersionNegotiator;

use super::schema;

pub(crate) const BACKEND_NAME: &str = "sqlite";

/// Virtual machine steps between deadline checks.
const PROGRESS_STEPS: i32 = 1_000;

pub(crate) fn internal_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::Internal {
        backend_name: BACKEND_NAME.to_string(),
        message,
        source: None,
    })
}

pub(crate) fn serialization_error(message: String) -> StorageError {
    StorageError::Backend(BackendError::SerializationError { message })
}

/// SQLite backend for FHIR resource storage.
///
/// Cloning is cheap and shares the pool, registry and negotiator.
///
/// An in-memory database lives inside a single connection, so its pool
/// holds exactly one. Internal helpers therefore take the connection they
/// run on and never check out a second one.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    config: SqliteBackendConfig,
    search_config: SearchConfig,
    /// Search parameter registry (in-memory cache of active parameters).
    search_registry: Arc<RwLock<SearchParameterRegistry>>,
    /// Extractor for deriving searchable values from resources.
    search_extractor: Arc<SearchParameterExtractor>,
    negotiator: Arc<VersionNegotiator>,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("config", &self.config)
            .field("strategy", &self.negotiator.strategy())
            .field("search_registry_len", &self.search_registry.read().len())
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(SqliteBackendConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(SqliteBackendConfig {
            path: path.as_ref().to_string_lossy().into_owned(),
            ..SqliteBackendConfig::default()
        })
    }

    /// Creates a backend with custom storage settings and default search
    /// and versioning behaviour.
    pub fn with_config(config: SqliteBackendConfig) -> StorageResult<Self> {
        Self::from_config(&EngineConfig {
            sqlite: config,
            ..EngineConfig::default()
        })
    }

    /// Creates a backend from the full engine configuration.
    pub fn from_config(config: &EngineConfig) -> StorageResult<Self> {
        let sqlite = config.sqlite.clone();
        let pool = Self::build_pool(&sqlite)?;

        let search_registry = Arc::new(RwLock::new(SearchParameterRegistry::with_embedded()));
        info!(
            parameters = search_registry.read().len(),
            "Loaded search parameters into registry"
        );
        let search_extractor = Arc::new(SearchParameterExtractor::new(search_registry.clone()));
        let negotiator = Arc::new(VersionNegotiator::new(
            config.versioning.strategy,
            config.versioning.canonical_version,
            config.versioning.default_version,
        ));

        let backend = Self {
            pool,
            config: sqlite,
            search_config: config.search.clone(),
            search_registry,
            search_extractor,
            negotiator,
        };
        backend.configure_connection()?;
        Ok(backend)
    }

    fn build_pool(config: &SqliteBackendConfig) -> StorageResult<Pool<SqliteConnectionManager>> {
        let busy_timeout = config.busy_timeout;
        let manager = if config.is_memory() {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(&config.path)
        }
        .with_init(move |conn| conn.busy_timeout(busy_timeout));

        let mut builder = Pool::builder().connection_timeout(config.connection_timeout);
        builder = if config.is_memory() {
            builder
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            builder.max_size(config.max_connections.max(1))
        };

        builder.build(manager).map_err(|e| {
            StorageError::Backend(BackendError::Unavailable {
                backend_name: BACKEND_NAME.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Configure connection settings.
    fn configure_connection(&self) -> StorageResult<()> {
        if self.config.enable_wal && !self.config.is_memory() {
            let conn = self.get_connection()?;
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!(mode = %mode, "SQLite did not switch to WAL journal mode");
            }
        }
        Ok(())
    }

    /// Initialize the database schema.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn)
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(
        &self,
    ) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction, committing on
    /// success and rolling back on error.
    pub(crate) fn write_transaction<T, F>(&self, conn: &Connection, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback(conn);
                    Err(e.into())
                }
            },
            Err(e) => {
                rollback(conn);
                Err(e)
            }
        }
    }

    /// Runs `f` on a pooled connection in a blocking task with a deadline.
    ///
    /// The connection's progress handler interrupts any statement that runs
    /// past the budget, or past a narrower step limit set through the
    /// watchdog. When the outer timer fires first the task is cancelled and
    /// still awaited, so the result always reflects what the database did:
    /// work that committed is reported as committed, and anything else that
    /// failed after the budget ran out is reported through `on_timeout`.
    pub(crate) async fn run_with_deadline<T, F, E>(
        &self,
        budget: Duration,
        on_timeout: E,
        f: F,
    ) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteBackend, &Connection, &StatementWatchdog) -> StorageResult<T>
            + Send
            + 'static,
        E: FnOnce(u64) -> StorageError,
    {
        let conn = self.get_connection()?;
        let backend = self.clone();
        let watchdog = StatementWatchdog::new(budget);
        let task_watchdog = watchdog.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let handler = task_watchdog.clone();
            conn.progress_handler(PROGRESS_STEPS, Some(move || handler.should_interrupt()));
            let result = f(&backend, &conn, &task_watchdog);
            conn.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);
            if !conn.is_autocommit() {
                warn!("Connection returned with an open transaction; rolling back");
                rollback(&conn);
            }
            let timed_out = result.is_err() && task_watchdog.overall_expired();
            (result, timed_out)
        });

        let timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        let joined = match tokio::time::timeout(budget, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                watchdog.cancel();
                warn!(timeout_ms, "Deadline exceeded; interrupting database work");
                task.await
            }
        };
        let (result, timed_out) =
            joined.map_err(|e| internal_error(format!("Blocking task failed: {}", e)))?;
        if timed_out {
            return Err(on_timeout(timeout_ms));
        }
        result
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.config.is_memory()
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }

    /// Returns the search paging and timeout settings.
    pub fn search_config(&self) -> &SearchConfig {
        &self.search_config
    }

    /// Returns a reference to the search parameter registry.
    pub fn search_registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.search_registry
    }

    /// Returns a reference to the search parameter extractor.
    pub fn search_extractor(&self) -> &Arc<SearchParameterExtractor> {
        &self.search_extractor
    }

    /// Returns the version negotiator applied to every write.
    pub fn negotiator(&self) -> &Arc<VersionNegotiator> {
        &self.negotiator
    }
}

/// Rolls back the open transaction, logging rather than masking the
/// original error.
/// Statement deadlines enforced by a connection's progress handler.
///
/// The overall limit covers the whole unit of work. A step limit narrows it
/// for one batch entry. Statements run inside [`hold`](Self::hold) are never
/// interrupted, so savepoint bookkeeping always completes.
#[derive(Debug, Clone)]
pub(crate) struct StatementWatchdog {
    state: Arc<WatchdogState>,
}

#[derive(Debug)]
struct WatchdogState {
    origin: Instant,
    overall_nanos: u64,
    step_nanos: AtomicU64,
    cancelled: AtomicBool,
    held: AtomicBool,
}

const NO_LIMIT: u64 = u64::MAX;

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(NO_LIMIT)
}

impl StatementWatchdog {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            state: Arc::new(WatchdogState {
                origin: Instant::now(),
                overall_nanos: nanos(budget),
                step_nanos: AtomicU64::new(NO_LIMIT),
                cancelled: AtomicBool::new(false),
                held: AtomicBool::new(false),
            }),
        }
    }

    fn elapsed(&self) -> u64 {
        nanos(self.state.origin.elapsed())
    }

    /// True once the overall budget is spent or the caller stopped waiting.
    pub(crate) fn overall_expired(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire) || self.elapsed() >= self.state.overall_nanos
    }

    /// Starts a step that must finish within `budget`.
    pub(crate) fn begin_step(&self, budget: Duration) {
        let end = self.elapsed().saturating_add(nanos(budget));
        self.state.step_nanos.store(end, Ordering::Release);
    }

    /// Ends the current step. Returns true if it overran its limit.
    pub(crate) fn end_step(&self) -> bool {
        let end = self.state.step_nanos.swap(NO_LIMIT, Ordering::AcqRel);
        end != NO_LIMIT && self.elapsed() >= end
    }

    pub(crate) fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Runs `f` with interruption suspended.
    pub(crate) fn hold<T>(&self, f: impl FnOnce() -> T) -> T {
        self.state.held.store(true, Ordering::Release);
        let out = f();
        self.state.held.store(false, Ordering::Release);
        out
    }

    fn should_interrupt(&self) -> bool {
        if self.state.held.load(Ordering::Acquire) {
            return false;
        }
        self.overall_expired() || self.elapsed() >= self.state.step_nanos.load(Ordering::Acquire)
    }
}

pub(crate) fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "Rollback failed");
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.init_schema().map_err(|e| BackendError::MigrationError {
            message: format!("Failed to initialize schema: {}", e),
        })
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let conn = self
            .get_connection()
            .map_err(|_| BackendError::Unavailable {
                backend_name: BACKEND_NAME.to_string(),
                message: "Failed to get connection".to_string(),
            })?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| BackendError::Internal {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("Health check failed: {}", e),
                source: None,
            })?;
        Ok(())
    }

    fn pool_stats(&self) -> BackendPoolStats {
        let state = self.pool.state();
        BackendPoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_connections: self.pool.max_size(),
        }
    }
}
