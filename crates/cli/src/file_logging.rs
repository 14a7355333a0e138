//! File-based logging configuration.
//!
//! Console output is always on. When `MIGRATE_FILE_LOGGING` is set, logs are
//! also written as JSON to daily rotating files so a long migration leaves an
//! audit trail behind.
//!
//! # Configuration
//!
//! - `MIGRATE_FILE_LOGGING`: Set to "true" or "1" to enable file logging
//! - `MIGRATE_LOG_DIR`: Override default log directory (defaults to `{data_dir}/logs`)
//! - `MIGRATE_LOG_MAX_FILES`: Number of daily log files to retain (default: 7)
//!
//! # Log Format
//!
//! ```json
//! {"timestamp":"2025-12-26T10:30:00Z","level":"INFO","target":"services::services::orchestrator","message":"..."}
//! ```

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use utils::assets::log_dir;

const LOG_FILE_PREFIX: &str = "catalog-migrate.log";

const DEFAULT_MAX_FILES: usize = 7;

/// Configuration for file logging.
#[derive(Debug, Clone)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    /// Number of daily log files to retain.
    pub max_files: usize,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        let enabled = std::env::var("MIGRATE_FILE_LOGGING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_files = std::env::var("MIGRATE_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FILES);

        Self {
            enabled,
            log_dir: log_dir(),
            max_files,
        }
    }
}

/// Filter applied to both layers: our crates at `log_level`, everything else at warn.
fn build_filter(log_level: &str) -> EnvFilter {
    let filter_string = format!(
        "warn,cli={level},services={level},db={level},utils={level}",
        level = log_level
    );
    EnvFilter::try_new(&filter_string).unwrap_or_else(|e| {
        eprintln!("Invalid log level '{log_level}' ({e}), falling back to info");
        EnvFilter::new("warn,cli=info,services=info,db=info,utils=info")
    })
}

/// Initialize the logging system with optional file output.
///
/// Returns a guard that must be held for the lifetime of the process so the
/// file writer is flushed on exit. `None` when file logging is disabled or
/// the log directory could not be created.
pub fn init_logging(log_level: &str) -> Option<WorkerGuard> {
    let config = FileLoggingConfig::default();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(build_filter(log_level));

    if !config.enabled {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("Failed to create log directory {:?}: {}", config.log_dir, e);
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(build_filter(log_level));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!(
        log_dir = ?config.log_dir,
        max_files = config.max_files,
        "File logging enabled"
    );

    let log_dir = config.log_dir.clone();
    let max_files = config.max_files;
    std::thread::spawn(move || {
        cleanup_old_logs(&log_dir, max_files);
    });

    Some(guard)
}

/// Remove all but the newest `max_files` log files. Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, max_files: usize) -> usize {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut log_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .filter_map(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| (e.path(), t))
        })
        .collect();

    // Newest first; daily suffixes break mtime ties
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.into_iter().skip(max_files) {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!("Removed old log file: {:?}", path);
            }
            Err(e) => tracing::warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }
    removed
}
