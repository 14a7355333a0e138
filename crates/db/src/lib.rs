use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use sqlx::{
    Error, Executor, SqlitePool,
    migrate::Migrator,
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
};
use tracing::{error, info};

pub mod backup;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod storage_stats;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validation;

pub use backup::{BackupError, BackupInfo, BackupService};
pub use metrics::StoreMetrics;
pub use retry::{RetryConfig, Retryable, is_retryable_error, with_retry, with_retry_if};
pub use store::{
    BackupStore, MaintenanceOp, MemoryStore, PageRequest, Row, RowFilter, SqliteStore,
    StoreError, StoreHealth, StoreReader, TableDdl, TargetStore, WriteMode, WriteSummary,
};

// ============================================================================
// Connection Pool Configuration
// ============================================================================

const DEFAULT_MAX_READ_CONNECTIONS: u32 = 8;

/// SQLite has a single writer; more write connections only queue on the lock.
const DEFAULT_MAX_WRITE_CONNECTIONS: u32 = 1;

const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Idle connection timeout in seconds (10 minutes).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

fn get_env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&n| n > 0 && n <= 100)
        .unwrap_or(default)
}

/// Pool sizing for a [`DBService`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_read_connections: u32,
    pub max_write_connections: u32,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    /// Reads `MIGRATE_SQLITE_READ_CONNECTIONS` and `MIGRATE_SQLITE_WRITE_CONNECTIONS`.
    fn default() -> Self {
        Self {
            max_read_connections: get_env_u32(
                "MIGRATE_SQLITE_READ_CONNECTIONS",
                DEFAULT_MAX_READ_CONNECTIONS,
            ),
            max_write_connections: get_env_u32(
                "MIGRATE_SQLITE_WRITE_CONNECTIONS",
                DEFAULT_MAX_WRITE_CONNECTIONS,
            ),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            busy_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// Apply performance and reliability pragmas to a SQLite connection.
/// These pragmas are applied on every new connection via `after_connect`.
///
/// - `temp_store = MEMORY` (2): Store temporary tables in memory
/// - `mmap_size`: Memory-mapped I/O for faster reads (64MB dev, 256MB prod)
/// - `synchronous = NORMAL`: Must be set AFTER mmap_size to ensure proper fsync
/// - `cache_size = -64000`: 64MB page cache (negative = KB)
/// - `wal_autocheckpoint = 2000`: Checkpoint every ~8MB; bulk loads write a lot
async fn apply_performance_pragmas(conn: &mut SqliteConnection) -> Result<(), Error> {
    conn.execute("PRAGMA temp_store = 2").await?;

    #[cfg(debug_assertions)]
    conn.execute("PRAGMA mmap_size = 67108864").await?; // 64MB

    #[cfg(not(debug_assertions))]
    conn.execute("PRAGMA mmap_size = 268435456").await?; // 256MB

    // CRITICAL: Set synchronous AFTER mmap_size. mmap'ed writes can bypass
    // fsync guarantees and cause SQLITE_IOERR (code 522) under load.
    conn.execute("PRAGMA synchronous = NORMAL").await?;

    conn.execute("PRAGMA cache_size = -64000").await?;

    conn.execute("PRAGMA wal_autocheckpoint = 2000").await?;

    Ok(())
}

// ============================================================================
// Schemas
// ============================================================================

/// The two schemas this crate manages. They may share one database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Legacy,
    Target,
}

impl Schema {
    /// Migrator for this schema. Versions applied by the other schema are ignored.
    pub fn migrator(self) -> Migrator {
        let mut migrator = match self {
            Schema::Legacy => sqlx::migrate!("./migrations/legacy"),
            Schema::Target => sqlx::migrate!("./migrations/target"),
        };
        migrator.set_ignore_missing(true);
        migrator
    }
}

// ============================================================================
// Database Integrity Check
// ============================================================================

/// Check database integrity using PRAGMA quick_check.
///
/// Faster than a full integrity_check and catches most corruption.
pub async fn check_database_integrity(pool: &SqlitePool) -> Result<(), store::StoreError> {
    let results: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await?;

    match results.first().map(String::as_str) {
        Some("ok") => Ok(()),
        _ => Err(store::StoreError::Integrity(results.join("; "))),
    }
}

/// Read and write pools over one SQLite file.
#[derive(Clone)]
pub struct DBService {
    pub read_pool: SqlitePool,
    pub write_pool: SqlitePool,
    pub db_path: PathBuf,
    pub metrics: StoreMetrics,
    read_only: bool,
}

impl DBService {
    /// Open (creating if missing) a database for reading and writing.
    pub async fn open(db_path: &Path) -> Result<DBService, Error> {
        Self::open_with(db_path, &PoolSettings::default()).await
    }

    pub async fn open_with(db_path: &Path, settings: &PoolSettings) -> Result<DBService, Error> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(false)
            .busy_timeout(settings.busy_timeout);

        tracing::info!(
            db = %db_path.display(),
            max_read_connections = settings.max_read_connections,
            max_write_connections = settings.max_write_connections,
            "Initializing SQLite connection pools"
        );

        let write_pool = SqlitePoolOptions::new()
            .max_connections(settings.max_write_connections)
            .min_connections(1)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
            .after_connect(|conn, _meta| {
                Box::pin(async move { apply_performance_pragmas(conn).await })
            })
            .connect_with(options.clone())
            .await?;

        if let Err(e) = check_database_integrity(&write_pool).await {
            error!(db = %db_path.display(), error = %e, "DATABASE CORRUPTION DETECTED");
            write_pool.close().await;
            return Err(Error::Protocol(e.to_string()));
        }

        let read_pool = SqlitePoolOptions::new()
            .max_connections(settings.max_read_connections)
            .min_connections(0)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
            .after_connect(|conn, _meta| {
                Box::pin(async move { apply_performance_pragmas(conn).await })
            })
            .connect_with(options)
            .await?;

        Ok(DBService {
            read_pool,
            write_pool,
            db_path: db_path.to_path_buf(),
            metrics: StoreMetrics::new(),
            read_only: false,
        })
    }

    /// Open an existing database read-only, e.g. a backup file.
    pub async fn open_read_only(db_path: &Path) -> Result<DBService, Error> {
        if !db_path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("database not found: {}", db_path.display()),
            )));
        }

        let settings = PoolSettings::default();
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .read_only(true)
            .foreign_keys(false)
            .busy_timeout(settings.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_read_connections)
            .min_connections(0)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await?;

        Ok(DBService {
            read_pool: pool.clone(),
            write_pool: pool,
            db_path: db_path.to_path_buf(),
            metrics: StoreMetrics::new(),
            read_only: true,
        })
    }

    /// Whether `schema` has migrations not yet applied to this database.
    pub async fn has_pending_migrations(&self, schema: Schema) -> bool {
        let applied: Vec<i64> =
            match sqlx::query_scalar::<_, i64>("SELECT version FROM _sqlx_migrations")
                .fetch_all(&self.read_pool)
                .await
            {
                Ok(versions) => versions,
                Err(_) => return true,
            };
        schema
            .migrator()
            .iter()
            .any(|migration| !applied.contains(&migration.version))
    }

    /// Apply pending migrations of `schema`.
    ///
    /// Runs on a dedicated connection with foreign keys off: SQLite cannot
    /// toggle `foreign_keys` inside the transaction SQLx wraps migrations in.
    pub async fn migrate(&self, schema: Schema) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::Protocol(format!(
                "cannot migrate read-only database {}",
                self.db_path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS));

        let migration_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("PRAGMA foreign_keys = OFF").await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        schema.migrator().run(&migration_pool).await?;
        migration_pool.close().await;

        info!(db = %self.db_path.display(), ?schema, "Schema migrations applied");
        Ok(())
    }

    /// Store facade over these pools.
    pub fn store(&self) -> SqliteStore {
        if self.read_only {
            SqliteStore::single_pool(
                self.read_pool.clone(),
                self.db_path.clone(),
                self.metrics.clone(),
            )
        } else {
            SqliteStore::new(
                self.read_pool.clone(),
                self.write_pool.clone(),
                self.db_path.clone(),
                self.metrics.clone(),
            )
        }
    }

    pub async fn close(&self) {
        self.read_pool.close().await;
        if !self.read_only {
            self.write_pool.close().await;
        }
    }
}
