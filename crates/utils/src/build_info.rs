use serde::Serialize;

/// Build information embedded at compile time
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_timestamp: &'static str,
}

macro_rules! option_env_or {
    ($name:expr, $default:expr) => {
        match option_env!($name) {
            Some(v) => v,
            None => $default,
        }
    };
}

/// Populated at compile time via build.rs
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    git_commit: option_env_or!("MIGRATE_GIT_COMMIT", "unknown"),
    build_timestamp: option_env_or!("MIGRATE_BUILD_TIMESTAMP", "unknown"),
};

impl BuildInfo {
    /// One-line version string for `--version` output and report headers.
    pub fn long_version(&self) -> String {
        format!(
            "{} (commit {}, built {})",
            self.version, self.git_commit, self.build_timestamp
        )
    }
}
