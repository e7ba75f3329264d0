//! Connection acquisition for the repository layer.
//!
//! [`ConnectionFactory`] is the seam every repository goes through: a
//! connection is opened (or checked out) per operation and released by RAII
//! when the operation's scope ends, never retained across calls. Two
//! implementations are provided:
//!
//! - [`SqliteConnectionFactory`] opens a fresh `rusqlite` connection per
//!   call, leaving pooling entirely to the caller's deployment.
//! - [`PooledConnectionFactory`] delegates to an `r2d2` pool whose
//!   customizer applies WAL mode, foreign keys, and performance pragmas to
//!   every connection.
//!
//! Opening and checkout run on the blocking pool; acquisition failures
//! surface as [`RepositoryError::Connection`] wrapping the cause.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_core::errors::{RepositoryError, Result};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Alias for a connection checked out of the pool.
pub type PooledHandle = r2d2::PooledConnection<SqliteConnectionManager>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum pool size.
pub const DEFAULT_POOL_SIZE: u32 = 16;
/// Default busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 30_000;
/// Default page cache size in KiB (8 MiB).
pub const DEFAULT_CACHE_SIZE_KIB: i64 = 8192;

/// Configuration for store connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 16). Ignored by the unpooled factory.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 30000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
    /// Page cache size in KiB (default: 8192 = 8 MiB).
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: i64,
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}
fn default_busy_timeout_ms() -> u32 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_cache_size_kib() -> i64 {
    DEFAULT_CACHE_SIZE_KIB
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            cache_size_kib: DEFAULT_CACHE_SIZE_KIB,
        }
    }
}

/// Apply WAL mode, foreign keys, and performance pragmas to a connection.
fn apply_pragmas(conn: &Connection, config: &ConnectionConfig) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;\
         PRAGMA busy_timeout = {};\
         PRAGMA foreign_keys = ON;\
         PRAGMA cache_size = -{};\
         PRAGMA synchronous = NORMAL;",
        config.busy_timeout_ms, config.cache_size_kib
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection handle
// ─────────────────────────────────────────────────────────────────────────────

enum Handle {
    Owned(Connection),
    Pooled(PooledHandle),
}

/// A scoped connection to the store.
///
/// Dereferences to [`rusqlite::Connection`] so statement helpers work
/// uniformly over owned and pooled handles. Dropping the handle releases the
/// connection on every exit path: an owned connection closes, a pooled one
/// returns to its pool.
pub struct StoreConnection {
    handle: Handle,
}

impl StoreConnection {
    /// Wrap a connection owned outright.
    #[must_use]
    pub fn owned(conn: Connection) -> Self {
        Self {
            handle: Handle::Owned(conn),
        }
    }

    /// Wrap a connection checked out of a pool.
    #[must_use]
    pub fn pooled(handle: PooledHandle) -> Self {
        Self {
            handle: Handle::Pooled(handle),
        }
    }
}

impl Deref for StoreConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.handle {
            Handle::Owned(conn) => conn,
            Handle::Pooled(handle) => handle,
        }
    }
}

impl DerefMut for StoreConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.handle {
            Handle::Owned(conn) => conn,
            Handle::Pooled(handle) => handle,
        }
    }
}

impl fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.handle {
            Handle::Owned(_) => "owned",
            Handle::Pooled(_) => "pooled",
        };
        f.debug_struct("StoreConnection").field("kind", &kind).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factories
// ─────────────────────────────────────────────────────────────────────────────

/// Opens a connection to the store on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open (or check out) a connection.
    ///
    /// Fails with [`RepositoryError::Connection`] wrapping the underlying
    /// cause when the store cannot be reached.
    async fn connection(&self) -> Result<StoreConnection>;
}

/// Factory that opens a fresh file-backed connection per call.
///
/// Each call opens a new `rusqlite` connection and applies the configured
/// pragmas. A `:memory:` path therefore yields an independent empty database
/// per acquisition; use a file path (or [`PooledConnectionFactory`]) when
/// state must be visible across calls.
#[derive(Clone, Debug)]
pub struct SqliteConnectionFactory {
    path: PathBuf,
    config: ConnectionConfig,
}

impl SqliteConnectionFactory {
    /// Build a factory for the database at `path` with default config.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, ConnectionConfig::default())
    }

    /// Build a factory with explicit connection config.
    #[must_use]
    pub fn with_config(path: impl Into<PathBuf>, config: ConnectionConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connection(&self) -> Result<StoreConnection> {
        let path = self.path.clone();
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            apply_pragmas(&conn, &config)?;
            Ok(conn)
        })
        .await
        .map_err(RepositoryError::connection)?
        .map_err(RepositoryError::connection)?;
        Ok(StoreConnection::owned(conn))
    }
}

/// Customizer that runs on each new pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    config: ConnectionConfig,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> rusqlite::Result<()> {
        apply_pragmas(conn, &self.config)
    }
}

/// Factory backed by an `r2d2` connection pool.
///
/// `connection()` checks a handle out of the pool; dropping the returned
/// [`StoreConnection`] returns it. Pool exhaustion past the 5 s checkout
/// timeout surfaces as [`RepositoryError::Connection`].
#[derive(Clone, Debug)]
pub struct PooledConnectionFactory {
    pool: ConnectionPool,
}

impl PooledConnectionFactory {
    /// Build a pool for the database file at `path`.
    pub fn new_file(path: impl AsRef<Path>, config: &ConnectionConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                config: config.clone(),
            }))
            .build(manager)
            .map_err(RepositoryError::connection)?;
        debug!(
            path = %path.as_ref().display(),
            pool_size = config.pool_size,
            "sqlite connection pool ready"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionFactory for PooledConnectionFactory {
    async fn connection(&self) -> Result<StoreConnection> {
        let pool = self.pool.clone();
        let handle = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(RepositoryError::connection)?
            .map_err(RepositoryError::connection)?;
        Ok(StoreConnection::pooled(handle))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pragma verification
// ─────────────────────────────────────────────────────────────────────────────

/// Pragma state for verification.
#[derive(Debug)]
pub struct PragmaState {
    /// Journal mode (should be "wal" for file-backed databases).
    pub journal_mode: String,
    /// Whether foreign keys are enabled.
    pub foreign_keys_enabled: bool,
    /// Configured busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

/// Read back the pragmas in effect on a connection.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    let busy_timeout_ms: u32 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
    Ok(PragmaState {
        journal_mode,
        foreign_keys_enabled: foreign_keys == 1,
        busy_timeout_ms,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
