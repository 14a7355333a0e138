//! Test utilities for database tests.
//!
//! Pools are created from a template database that already has both the
//! legacy and target schemas applied, so each test pays only for a file copy.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::OnceCell;

use crate::{DBService, PoolSettings, Schema};

static TEMPLATE_DIR: OnceLock<TempDir> = OnceLock::new();
static TEMPLATE_READY: OnceCell<()> = OnceCell::const_new();

fn get_template_dir() -> &'static TempDir {
    TEMPLATE_DIR.get_or_init(|| TempDir::new().expect("Failed to create template temp dir"))
}

async fn ensure_template_ready() {
    TEMPLATE_READY
        .get_or_init(|| async {
            let template_path = get_template_dir().path().join("template.db");

            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}", template_path.display()))
                    .expect("Invalid template database URL")
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);

            let pool = SqlitePoolOptions::new()
                .min_connections(0)
                .max_connections(1)
                .connect_with(options)
                .await
                .expect("Failed to create template pool");

            for schema in [Schema::Legacy, Schema::Target] {
                schema
                    .migrator()
                    .run(&pool)
                    .await
                    .expect("Failed to run migrations on template");
            }

            // Fold the WAL back into the main file before copying
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&pool)
                .await
                .expect("Failed to checkpoint template");
            pool.close().await;

            tracing::debug!("Template database ready at {:?}", template_path);
        })
        .await;
}

fn copy_template(temp_dir: &TempDir) -> std::path::PathBuf {
    let db_path = temp_dir.path().join("test.db");
    let template_path = get_template_dir().path().join("template.db");
    std::fs::copy(&template_path, &db_path).expect("Failed to copy template database");
    db_path
}

/// Pool over a fresh database holding both schemas.
///
/// The returned TempDir must be kept alive for the duration of the test.
pub async fn create_test_pool() -> (SqlitePool, TempDir) {
    ensure_template_ready().await;

    let temp_dir = TempDir::new().expect("Failed to create test temp dir");
    let db_path = copy_template(&temp_dir);

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .expect("Invalid test database URL")
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(false);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .expect("Failed to create test pool");

    (pool, temp_dir)
}

/// Full [`DBService`] (separate read and write pools) over a fresh database.
pub async fn create_test_service() -> (DBService, TempDir) {
    ensure_template_ready().await;

    let temp_dir = TempDir::new().expect("Failed to create test temp dir");
    let db_path = copy_template(&temp_dir);
    let settings = PoolSettings {
        max_read_connections: 4,
        max_write_connections: 1,
        acquire_timeout: Duration::from_secs(5),
        ..PoolSettings::default()
    };
    let service = DBService::open_with(&db_path, &settings)
        .await
        .expect("Failed to open test database");

    (service, temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_pool_has_both_schemas() {
        let (pool, _temp_dir) = create_test_pool().await;

        for table in ["legacy_suppliers", "suppliers", "legacy_uploads", "upload_history"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .expect("table should exist");
            assert_eq!(count, 0);
        }
    }

    #[tokio::test]
    async fn test_template_reuse_gives_isolated_databases() {
        let (pool1, _temp1) = create_test_pool().await;
        let (pool2, _temp2) = create_test_pool().await;

        sqlx::query(
            "INSERT INTO legacy_suppliers (id, supplier_code, created_at) VALUES (1, 'A', '2025-01-01')",
        )
        .execute(&pool1)
        .await
        .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM legacy_suppliers")
            .fetch_one(&pool2)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
