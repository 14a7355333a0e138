//! Storage statistics for SQLite database files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use ts_rs::TS;

use crate::store::StoreError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StorageStats {
    /// Size of the main database file in bytes
    pub database_size_bytes: u64,
    /// Size of the WAL (Write-Ahead Log) file in bytes
    pub wal_size_bytes: u64,
    /// Number of free pages in the database (reclaimable with VACUUM)
    pub free_pages: i64,
    /// Size of each database page in bytes
    pub page_size: i64,
}

/// The WAL file sits next to the database as `<name>-wal`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}

/// Database and WAL file sizes; missing files count as zero.
pub fn file_sizes(db_path: &Path) -> (u64, u64) {
    let size = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    (size(db_path), size(&wal_path(db_path)))
}

pub async fn get_storage_stats(
    pool: &SqlitePool,
    db_path: &Path,
) -> Result<StorageStats, StoreError> {
    let (database_size_bytes, wal_size_bytes) = file_sizes(db_path);

    let page_size: i64 = sqlx::query_scalar("SELECT page_size FROM pragma_page_size()")
        .fetch_one(pool)
        .await?;

    let free_pages: i64 = sqlx::query_scalar("SELECT freelist_count FROM pragma_freelist_count()")
        .fetch_one(pool)
        .await?;

    Ok(StorageStats {
        database_size_bytes,
        wal_size_bytes,
        free_pages,
        page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_pool;

    #[test]
    fn test_wal_path_appends_suffix() {
        assert_eq!(
            wal_path(Path::new("/data/target.sqlite")),
            PathBuf::from("/data/target.sqlite-wal")
        );
        assert_eq!(wal_path(Path::new("db")), PathBuf::from("db-wal"));
    }

    #[test]
    fn test_file_sizes_missing_files() {
        assert_eq!(file_sizes(Path::new("/nonexistent/x.sqlite")), (0, 0));
    }

    #[tokio::test]
    async fn test_get_storage_stats() {
        let (pool, temp_dir) = create_test_pool().await;
        let db_path = temp_dir.path().join("test.db");

        let stats = get_storage_stats(&pool, &db_path).await.unwrap();
        assert!(stats.database_size_bytes > 0);
        assert!(stats.page_size > 0);
        assert!(stats.free_pages >= 0);
    }
}
