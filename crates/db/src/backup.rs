//! Target database backups taken before a migration writes anything.
//!
//! Backups are consistent single-file copies produced with `VACUUM INTO`, so
//! they can be opened read-only as a [`crate::store::BackupStore`] for
//! snapshot and selective rollback.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;

const BACKUP_PREFIX: &str = "db_backup_";
const BACKUP_SUFFIX: &str = ".sqlite";
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Number of backups to retain (older ones are deleted by cleanup)
pub const DEFAULT_BACKUP_RETENTION: usize = 5;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup filename: {0}")]
    InvalidFilename(String),
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("backup {0} is not a SQLite database")]
    InvalidData(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Information about a database backup file.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BackupInfo {
    /// Filename of the backup (e.g., "db_backup_20250101_100000_000.sqlite")
    pub filename: String,
    #[serde(skip)]
    #[ts(skip)]
    pub path: PathBuf,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Manages the backup directory.
#[derive(Debug, Clone)]
pub struct BackupService {
    dir: PathBuf,
}

impl BackupService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Backups under `MIGRATE_BACKUP_DIR` or the default data directory.
    pub fn default_location() -> Self {
        Self::new(utils::assets::backup_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Only `db_backup_*.sqlite` names without path components are accepted.
    fn validate_filename(filename: &str) -> Result<(), BackupError> {
        let valid = filename.starts_with(BACKUP_PREFIX)
            && filename.ends_with(BACKUP_SUFFIX)
            && filename.len() > BACKUP_PREFIX.len() + BACKUP_SUFFIX.len()
            && !filename.contains("..")
            && !filename.contains('/')
            && !filename.contains('\\');
        if valid {
            Ok(())
        } else {
            Err(BackupError::InvalidFilename(filename.to_string()))
        }
    }

    fn is_backup_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| Self::validate_filename(n).is_ok())
    }

    fn has_sqlite_header(path: &Path) -> Result<bool, std::io::Error> {
        use std::io::Read;
        let mut header = [0u8; 16];
        let mut file = std::fs::File::open(path)?;
        match file.read_exact(&mut header) {
            Ok(()) => Ok(&header == SQLITE_HEADER),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a consistent copy of the database behind `pool`.
    pub async fn create_backup(&self, pool: &SqlitePool) -> Result<BackupInfo, BackupError> {
        std::fs::create_dir_all(&self.dir)?;

        let created_at = Utc::now();
        let filename = format!(
            "{BACKUP_PREFIX}{}{BACKUP_SUFFIX}",
            created_at.format("%Y%m%d_%H%M%S_%3f")
        );
        let path = self.dir.join(&filename);

        sqlx::query("VACUUM INTO ?")
            .bind(path.to_string_lossy().to_string())
            .execute(pool)
            .await?;

        if !Self::has_sqlite_header(&path)? {
            let _ = std::fs::remove_file(&path);
            return Err(BackupError::InvalidData(filename));
        }

        let size_bytes = std::fs::metadata(&path)?.len();
        info!(backup_path = %path.display(), size_bytes, "Pre-migration database backup created");

        Ok(BackupInfo {
            filename,
            path,
            created_at,
            size_bytes,
        })
    }

    /// All backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut backups: Vec<BackupInfo> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter(|e| Self::is_backup_file(&e.path()))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some(BackupInfo {
                    filename: e.file_name().to_string_lossy().to_string(),
                    path: e.path(),
                    created_at: DateTime::from(meta.modified().ok()?),
                    size_bytes: meta.len(),
                })
            })
            .collect();

        // Timestamped names sort chronologically; ties fall back to mtime.
        backups.sort_by(|a, b| {
            b.filename
                .cmp(&a.filename)
                .then(b.created_at.cmp(&a.created_at))
        });

        Ok(backups)
    }

    pub fn latest(&self) -> Result<Option<BackupInfo>, BackupError> {
        Ok(self.list_backups()?.into_iter().next())
    }

    /// Keep the newest `keep_count` backups and remove the rest.
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize, BackupError> {
        let mut removed = 0;
        for old_backup in self.list_backups()?.into_iter().skip(keep_count) {
            if let Err(e) = std::fs::remove_file(&old_backup.path) {
                warn!(path = %old_backup.path.display(), error = ?e, "Failed to remove old backup");
                continue;
            }
            removed += 1;
            info!(path = %old_backup.path.display(), "Removed old backup");
        }
        Ok(removed)
    }

    pub fn delete_backup(&self, filename: &str) -> Result<(), BackupError> {
        let backup_path = self.get_backup_path(filename)?;
        std::fs::remove_file(&backup_path)?;
        info!(filename = %filename, "Database backup deleted");
        Ok(())
    }

    /// Resolve a backup filename inside the backup directory.
    pub fn get_backup_path(&self, filename: &str) -> Result<PathBuf, BackupError> {
        Self::validate_filename(filename)?;

        let backup_path = self.dir.join(filename);
        if !backup_path.exists() {
            return Err(BackupError::NotFound(filename.to_string()));
        }
        Ok(backup_path)
    }
}
