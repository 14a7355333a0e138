//! Migration configuration.
//!
//! Loaded from `config.json` (missing file means defaults), then overridden by
//! `MIGRATE_*` environment variables, then validated before any store is
//! touched.

use std::{path::Path, str::FromStr, time::Duration};

use db::{RetryConfig, WriteMode, models::Entity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BATCH_SIZE: u64 = 1000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.05;
const DEFAULT_PROGRESS_REPORT_INTERVAL: u64 = 1000;
const DEFAULT_VALIDATION_SAMPLE_SIZE: u64 = 100;
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 4 * 60 * 60;

const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;
const DEFAULT_MONITOR_RETENTION_SECS: u64 = 60 * 60;
const DEFAULT_STATUS_HISTORY: usize = 100;
const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.05;
const DEFAULT_MIN_THROUGHPUT: f64 = 10.0;
const DEFAULT_MEMORY_THRESHOLD_PERCENT: f64 = 85.0;
const DEFAULT_POOL_USAGE_THRESHOLD: f64 = 0.9;
const DEFAULT_METRICS_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// One entity selected for migration and what must finish before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub entity: Entity,
    #[serde(default)]
    pub dependencies: Vec<Entity>,
}

impl EntityConfig {
    /// Entity with the dependencies implied by the target schema.
    pub fn with_default_dependencies(entity: Entity) -> Self {
        Self {
            entity,
            dependencies: entity.default_dependencies().to_vec(),
        }
    }
}

pub fn default_entities() -> Vec<EntityConfig> {
    Entity::ALL
        .into_iter()
        .map(EntityConfig::with_default_dependencies)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Samples older than this are dropped.
    pub retention_secs: u64,
    /// Number of published status snapshots kept.
    pub status_history: usize,
    pub error_rate_threshold: f64,
    /// Records per second below which an in-progress entity raises an alert.
    pub min_throughput: f64,
    pub memory_threshold_percent: f64,
    pub pool_usage_threshold: f64,
    /// Upper bound on a single store/system metrics collection.
    pub metrics_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            retention_secs: DEFAULT_MONITOR_RETENTION_SECS,
            status_history: DEFAULT_STATUS_HISTORY,
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
            min_throughput: DEFAULT_MIN_THROUGHPUT,
            memory_threshold_percent: DEFAULT_MEMORY_THRESHOLD_PERCENT,
            pool_usage_threshold: DEFAULT_POOL_USAGE_THRESHOLD,
            metrics_timeout_ms: DEFAULT_METRICS_TIMEOUT_MS,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub batch_size: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Read and transform everything, write nothing.
    pub dry_run: bool,
    pub rollback_on_failure: bool,
    /// Abort the entity on the first batch whose retries are exhausted.
    pub fail_fast: bool,
    /// Fraction of failed records above which an entity aborts.
    pub failure_threshold: f64,
    pub progress_report_interval: u64,
    pub validation_sample_size: u64,
    /// Rows scanned per entity by the pre-migration quality checks; `None` scans all.
    pub quality_scan_limit: Option<u64>,
    pub batch_timeout_secs: u64,
    pub pipeline_timeout_secs: u64,
    pub write_mode: WriteMode,
    pub entities: Vec<EntityConfig>,
    pub monitor: MonitorConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            dry_run: false,
            rollback_on_failure: true,
            fail_fast: false,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            progress_report_interval: DEFAULT_PROGRESS_REPORT_INTERVAL,
            validation_sample_size: DEFAULT_VALIDATION_SAMPLE_SIZE,
            quality_scan_limit: None,
            batch_timeout_secs: DEFAULT_BATCH_TIMEOUT_SECS,
            pipeline_timeout_secs: DEFAULT_PIPELINE_TIMEOUT_SECS,
            write_mode: WriteMode::default(),
            entities: default_entities(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl MigrationConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.max_retries,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }

    pub fn selected_entities(&self) -> Vec<Entity> {
        self.entities.iter().map(|e| e.entity).collect()
    }

    /// Restrict the run to `entities`, keeping dependencies implied by the schema.
    pub fn select_entities(&mut self, entities: &[Entity]) {
        self.entities = entities
            .iter()
            .copied()
            .map(EntityConfig::with_default_dependencies)
            .collect();
    }

    /// Apply `MIGRATE_*` overrides from the environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_override("MIGRATE_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = env_override("MIGRATE_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = env_override("MIGRATE_RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = env_override("MIGRATE_RETRY_MAX_DELAY_MS")? {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = env_flag("MIGRATE_DRY_RUN") {
            self.dry_run = v;
        }
        if let Some(v) = env_flag("MIGRATE_ROLLBACK_ON_FAILURE") {
            self.rollback_on_failure = v;
        }
        if let Some(v) = env_flag("MIGRATE_FAIL_FAST") {
            self.fail_fast = v;
        }
        if let Some(v) = env_override("MIGRATE_FAILURE_THRESHOLD")? {
            self.failure_threshold = v;
        }
        if let Some(v) = env_override("MIGRATE_PROGRESS_INTERVAL")? {
            self.progress_report_interval = v;
        }
        if let Some(v) = env_override("MIGRATE_VALIDATION_SAMPLE_SIZE")? {
            self.validation_sample_size = v;
        }
        if let Some(v) = env_override("MIGRATE_BATCH_TIMEOUT_SECS")? {
            self.batch_timeout_secs = v;
        }
        if let Some(v) = env_override("MIGRATE_PIPELINE_TIMEOUT_SECS")? {
            self.pipeline_timeout_secs = v;
        }
        if let Some(v) = env_override::<WriteMode>("MIGRATE_WRITE_MODE")? {
            self.write_mode = v;
        }
        if let Some(raw) = env_value("MIGRATE_ENTITIES") {
            let entities = db::validation::parse_entity_list(&raw)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            self.select_entities(&entities);
        }
        Ok(())
    }

    /// Reject values that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return invalid("failure_threshold must be between 0.0 and 1.0");
        }
        if self.progress_report_interval == 0 {
            return invalid("progress_report_interval must be greater than 0");
        }
        if self.batch_timeout_secs == 0 || self.pipeline_timeout_secs == 0 {
            return invalid("timeouts must be greater than 0");
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return invalid("retry_base_delay_ms must not exceed retry_max_delay_ms");
        }
        if self.entities.is_empty() {
            return invalid("at least one entity must be selected");
        }
        if self.monitor.interval_secs == 0 {
            return invalid("monitor.interval_secs must be greater than 0");
        }
        if self.monitor.status_history == 0 {
            return invalid("monitor.status_history must be greater than 0");
        }
        Ok(())
    }
}

fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_override<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env_value(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ValidationError(format!("{var}: invalid value '{raw}'"))),
    }
}

fn env_flag(var: &str) -> Option<bool> {
    env_value(var).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Read the config file, falling back to defaults when it does not exist.
pub fn load_config_from_file(config_path: &Path) -> Result<MigrationConfig, ConfigError> {
    match std::fs::read_to_string(config_path) {
        Ok(raw_config) => Ok(serde_json::from_str(&raw_config)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %config_path.display(), "No config file found, using defaults");
            Ok(MigrationConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// File, then environment, then validation.
pub fn load_config(config_path: &Path) -> Result<MigrationConfig, ConfigError> {
    let mut config = load_config_from_file(config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn save_config_to_file(config: &MigrationConfig, config_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw_config = serde_json::to_string_pretty(config)?;
    std::fs::write(config_path, raw_config)?;
    Ok(())
}
