//! Integration tests for the pragmas `DBService` applies to every pooled
//! connection:
//! - journal_mode = WAL
//! - synchronous = NORMAL
//! - temp_store = MEMORY
//! - cache_size = -64000 (64MB)
//! - wal_autocheckpoint = 2000

use db::{DBService, PoolSettings, Schema};
use sqlx::{Executor, Row};
use tempfile::TempDir;

async fn open_service() -> (DBService, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let settings = PoolSettings {
        max_read_connections: 3,
        ..PoolSettings::default()
    };
    let db = DBService::open_with(&temp_dir.path().join("target.sqlite"), &settings)
        .await
        .expect("Failed to open database");
    db.migrate(Schema::Target)
        .await
        .expect("Failed to run migrations");
    (db, temp_dir)
}

#[tokio::test]
async fn test_sqlite_pragma_journal_mode_wal() {
    let (db, _temp_dir) = open_service().await;

    let row = db
        .write_pool
        .fetch_one(sqlx::query("PRAGMA journal_mode"))
        .await
        .expect("Failed to query journal_mode");

    let journal_mode: String = row.get(0);
    assert_eq!(journal_mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_sqlite_pragma_synchronous_normal() {
    let (db, _temp_dir) = open_service().await;

    let row = db
        .write_pool
        .fetch_one(sqlx::query("PRAGMA synchronous"))
        .await
        .expect("Failed to query synchronous");

    let synchronous: i32 = row.get(0);
    // NORMAL = 1
    assert_eq!(synchronous, 1);
}

#[tokio::test]
async fn test_sqlite_pragma_cache_and_checkpoint() {
    let (db, _temp_dir) = open_service().await;

    let cache_size: i32 = db
        .write_pool
        .fetch_one(sqlx::query("PRAGMA cache_size"))
        .await
        .expect("Failed to query cache_size")
        .get(0);
    assert_eq!(cache_size, -64000);

    let autocheckpoint: i32 = db
        .write_pool
        .fetch_one(sqlx::query("PRAGMA wal_autocheckpoint"))
        .await
        .expect("Failed to query wal_autocheckpoint")
        .get(0);
    assert_eq!(autocheckpoint, 2000);
}

#[tokio::test]
async fn test_sqlite_pragmas_applied_to_all_read_connections() {
    let (db, _temp_dir) = open_service().await;

    // Hold several connections at once so each one is a fresh connection
    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(
            db.read_pool
                .acquire()
                .await
                .expect("Failed to acquire connection"),
        );
    }
    for (i, conn) in conns.iter_mut().enumerate() {
        let row = sqlx::query("PRAGMA temp_store")
            .fetch_one(&mut **conn)
            .await
            .expect("Failed to query temp_store");

        let temp_store: i32 = row.get(0);
        assert_eq!(temp_store, 2, "Connection {} should have temp_store = MEMORY", i);
    }
}

#[tokio::test]
async fn test_read_only_service_rejects_migrations() {
    let (db, temp_dir) = open_service().await;
    db.close().await;

    let read_only = DBService::open_read_only(&temp_dir.path().join("target.sqlite"))
        .await
        .expect("Failed to open read-only");
    assert!(!read_only.has_pending_migrations(Schema::Target).await);
    assert!(read_only.migrate(Schema::Legacy).await.is_err());
    assert!(
        DBService::open_read_only(&temp_dir.path().join("missing.sqlite"))
            .await
            .is_err()
    );
}
