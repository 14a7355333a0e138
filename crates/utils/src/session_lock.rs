//! Cross-process lock guaranteeing one migration session per target store.
//!
//! A lock is a small JSON file named after a hash of the target path. It is
//! created with `create_new` so two processes can never both own it, and it is
//! removed when the [`SessionLock`] guard is dropped. Files left behind by a
//! process that no longer exists are treated as stale and reclaimed.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    process,
};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionLockError {
    #[error(
        "target {target} is locked by pid {pid} ({operation}, started {started_at}); remove {lock_path} if that process is gone"
    )]
    Held {
        target: String,
        pid: u32,
        operation: String,
        started_at: String,
        lock_path: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Contents of a lock file.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct SessionLockInfo {
    /// Target store the lock protects
    pub target: PathBuf,
    /// Process holding the lock
    pub pid: u32,
    /// What the holder is doing ("migrate", "rollback")
    pub operation: String,
    /// When the lock was taken (RFC 3339)
    pub started_at: String,
}

impl SessionLockInfo {
    fn new(target: &Path, operation: &str) -> Self {
        Self {
            target: target.to_path_buf(),
            pid: process::id(),
            operation: operation.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Check if the holder process is still running.
    pub fn is_running(&self) -> bool {
        #[cfg(unix)]
        {
            Path::new(&format!("/proc/{}", self.pid)).exists()
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

/// Guard owning the lock file; the file is removed on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    info: SessionLockInfo,
}

impl SessionLock {
    /// Default directory lock files are kept in.
    pub fn lock_dir() -> PathBuf {
        crate::assets::data_dir().join("locks")
    }

    fn lock_filename(target: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(target.to_string_lossy().as_bytes());
        let hash = hasher.finalize();
        format!(
            "{:016x}.lock",
            hash[..8].iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
        )
    }

    pub fn acquire(target: &Path, operation: &str) -> Result<Self, SessionLockError> {
        Self::acquire_in(&Self::lock_dir(), target, operation)
    }

    pub fn acquire_in(
        dir: &Path,
        target: &Path,
        operation: &str,
    ) -> Result<Self, SessionLockError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::lock_filename(target));
        let info = SessionLockInfo::new(target, operation);

        // Second attempt only happens after a stale lock was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
                    tracing::debug!(
                        lock = %path.display(),
                        target = %target.display(),
                        operation,
                        "Acquired session lock"
                    );
                    return Ok(Self { path, info });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder: SessionLockInfo =
                        serde_json::from_str(&std::fs::read_to_string(&path)?)?;
                    if holder.is_running() && holder.pid != info.pid {
                        return Err(SessionLockError::Held {
                            target: target.display().to_string(),
                            pid: holder.pid,
                            operation: holder.operation,
                            started_at: holder.started_at,
                            lock_path: path.display().to_string(),
                        });
                    }
                    tracing::warn!(
                        lock = %path.display(),
                        stale_pid = holder.pid,
                        "Removing stale session lock"
                    );
                    std::fs::remove_file(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SessionLockError::Io(std::io::Error::other(format!(
            "could not acquire session lock {}",
            path.display()
        ))))
    }

    pub fn info(&self) -> &SessionLockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release session lock");
        }
    }
}
