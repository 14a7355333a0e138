use std::path::PathBuf;

use directories::ProjectDirs;

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| crate::path::expand_tilde(&v))
}

/// Base directory for everything the migration tool persists.
///
/// Respects `MIGRATE_DATA_DIR`. Falls back to the platform data directory and,
/// if the platform gives us no home directory, to the system temp directory.
pub fn data_dir() -> PathBuf {
    if let Some(path) = env_path("MIGRATE_DATA_DIR") {
        return path;
    }
    ProjectDirs::from("io", "catalog", "catalog-migrate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("catalog-migrate"))
    // macOS → ~/Library/Application Support/io.catalog.catalog-migrate
    // Linux → ~/.local/share/catalog-migrate (respects XDG_DATA_HOME)
}

/// Get the configuration directory path.
///
/// Respects `MIGRATE_CONFIG_DIR`. Default: `{data_dir}`
pub fn config_dir() -> PathBuf {
    env_path("MIGRATE_CONFIG_DIR").unwrap_or_else(data_dir)
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Legacy (source) database file. Respects `MIGRATE_SOURCE_DATABASE_PATH`.
pub fn source_database_path() -> PathBuf {
    env_path("MIGRATE_SOURCE_DATABASE_PATH").unwrap_or_else(|| data_dir().join("legacy.sqlite"))
}

/// Target database file. Respects `MIGRATE_TARGET_DATABASE_PATH`.
pub fn target_database_path() -> PathBuf {
    env_path("MIGRATE_TARGET_DATABASE_PATH").unwrap_or_else(|| data_dir().join("target.sqlite"))
}

/// Get the backup directory path.
///
/// Respects `MIGRATE_BACKUP_DIR`. Default: `{data_dir}/backups`
pub fn backup_dir() -> PathBuf {
    env_path("MIGRATE_BACKUP_DIR").unwrap_or_else(|| data_dir().join("backups"))
}

/// Directory migration and rollback reports are written to.
///
/// Respects `MIGRATE_REPORT_DIR`. Default: `{data_dir}/reports`
pub fn report_dir() -> PathBuf {
    env_path("MIGRATE_REPORT_DIR").unwrap_or_else(|| data_dir().join("reports"))
}

pub fn log_dir() -> PathBuf {
    env_path("MIGRATE_LOG_DIR").unwrap_or_else(|| data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_target_database_path_default() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::remove_var("MIGRATE_TARGET_DATABASE_PATH") };
        let path = target_database_path();
        assert!(path.ends_with("target.sqlite"));
    }

    #[test]
    #[serial]
    fn test_target_database_path_env_override() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("MIGRATE_TARGET_DATABASE_PATH", "/custom/path/target.db") };
        let path = target_database_path();
        unsafe { env::remove_var("MIGRATE_TARGET_DATABASE_PATH") };
        assert_eq!(path, PathBuf::from("/custom/path/target.db"));
    }

    #[test]
    #[serial]
    fn test_backup_dir_tilde_expansion() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("MIGRATE_BACKUP_DIR", "~/my-backups") };
        let dir = backup_dir();
        unsafe { env::remove_var("MIGRATE_BACKUP_DIR") };
        assert!(!dir.to_string_lossy().contains('~'));
        assert!(dir.ends_with("my-backups"));
    }

    #[test]
    #[serial]
    fn test_report_dir_follows_data_dir() {
        let temp = tempfile::tempdir().unwrap();
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe {
            env::remove_var("MIGRATE_REPORT_DIR");
            env::set_var("MIGRATE_DATA_DIR", temp.path());
        }
        let dir = report_dir();
        let config = config_path();
        unsafe { env::remove_var("MIGRATE_DATA_DIR") };

        assert_eq!(dir, temp.path().join("reports"));
        assert_eq!(config, temp.path().join("config.json"));
    }

    #[test]
    #[serial]
    fn test_blank_override_is_ignored() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe { env::set_var("MIGRATE_REPORT_DIR", "  ") };
        let dir = report_dir();
        unsafe { env::remove_var("MIGRATE_REPORT_DIR") };
        assert!(dir.ends_with("reports"));
    }
}
