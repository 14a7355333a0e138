//! Subcommand implementations behind the `catalog-migrate` binary.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow, bail};
use clap::{Args, Subcommand};
use db::{
    BackupService, BackupStore, DBService, Schema, WriteMode,
    backup::DEFAULT_BACKUP_RETENTION,
    metrics::StoreMetricsSnapshot,
    models::Entity,
    validation::{format_timestamp, parse_timestamp},
};
use futures::StreamExt;
use services::services::{
    config::{MigrationConfig, load_config},
    events::{EventBus, MigrationEvent},
    orchestrator::MigrationOrchestrator,
    progress_monitor::SysinfoProbe,
    report::{MigrationReport, ReportWriter},
    rollback::{RollbackEngine, RollbackReport, RollbackRequest, RollbackStrategy, RollbackTrigger},
    session::{EntityStatus, MigrationSession},
};
use tokio::task::JoinHandle;
use utils::{assets, build_info::BUILD_INFO, session_lock::SessionLock};

/// Filesystem locations one invocation works with.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub source: PathBuf,
    pub target: PathBuf,
    pub backups: BackupService,
    pub reports: ReportWriter,
}

impl Paths {
    /// Explicit paths win over `MIGRATE_*` variables, which win over the data directory.
    pub fn resolve(
        config: Option<PathBuf>,
        source: Option<PathBuf>,
        target: Option<PathBuf>,
    ) -> Self {
        Self {
            config: config.unwrap_or_else(assets::config_path),
            source: source.unwrap_or_else(assets::source_database_path),
            target: target.unwrap_or_else(assets::target_database_path),
            backups: BackupService::default_location(),
            reports: ReportWriter::default_location(),
        }
    }
}

#[derive(Debug, Args, Default)]
pub struct MigrateArgs {
    /// Read and transform everything without writing to the target
    #[arg(long)]
    pub dry_run: bool,

    /// Entities to migrate (comma-separated); defaults to the configured set
    #[arg(long, value_delimiter = ',')]
    pub entities: Vec<Entity>,

    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Abort an entity on its first failed batch
    #[arg(long)]
    pub fail_fast: bool,

    /// Leave the target as-is when the run fails
    #[arg(long)]
    pub no_rollback: bool,

    /// Do not snapshot the target before writing
    #[arg(long)]
    pub skip_backup: bool,

    /// `insert` or `upsert`
    #[arg(long)]
    pub write_mode: Option<WriteMode>,
}

impl MigrateArgs {
    fn apply(&self, config: &mut MigrationConfig) {
        if self.dry_run {
            config.dry_run = true;
        }
        if !self.entities.is_empty() {
            config.select_entities(&self.entities);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.fail_fast {
            config.fail_fast = true;
        }
        if self.no_rollback {
            config.rollback_on_failure = false;
        }
        if let Some(mode) = self.write_mode {
            config.write_mode = mode;
        }
    }
}

#[derive(Debug, Args, Default)]
pub struct RollbackArgs {
    /// snapshot, selective, incremental or partial; defaults to incremental
    #[arg(long)]
    pub strategy: Option<String>,

    /// Tables a selective rollback restores (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tables: Vec<Entity>,

    /// Start of a partial rollback window (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<String>,

    /// End of a partial rollback window, exclusive
    #[arg(long)]
    pub to: Option<String>,

    /// Entities to roll back; defaults to those touched by the last migration
    #[arg(long, value_delimiter = ',')]
    pub entities: Vec<Entity>,

    /// Backup file to restore from; defaults to the newest backup
    #[arg(long)]
    pub backup: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum BackupCommands {
    /// List backups, newest first
    List,
    /// Snapshot the target database now
    Create {
        /// Backups to retain afterwards
        #[arg(long, default_value_t = DEFAULT_BACKUP_RETENTION)]
        keep: usize,
    },
    /// Check a backup is a readable, intact database
    Verify {
        /// Backup filename; defaults to the newest backup
        filename: Option<String>,
    },
}

// ============================================================================
// migrate
// ============================================================================

pub async fn migrate(paths: &Paths, args: MigrateArgs) -> anyhow::Result<MigrationReport> {
    let mut config = load_config(&paths.config)
        .with_context(|| format!("failed to load config {}", paths.config.display()))?;
    args.apply(&mut config);
    config.validate()?;

    let _lock = SessionLock::acquire(&paths.target, "migrate")?;

    let source_db = DBService::open_read_only(&paths.source)
        .await
        .with_context(|| format!("failed to open source {}", paths.source.display()))?;
    let target_db = open_target(paths).await?;

    let backup_db = if config.dry_run || args.skip_backup {
        None
    } else {
        let info = paths.backups.create_backup(&target_db.write_pool).await?;
        paths.backups.cleanup_old_backups(DEFAULT_BACKUP_RETENTION)?;
        Some(DBService::open_read_only(&info.path).await?)
    };

    let mut orchestrator = MigrationOrchestrator::new(
        Arc::new(source_db.store()),
        Arc::new(target_db.store()),
    )
    .with_report_writer(paths.reports.clone());
    if let Some(backup_db) = &backup_db {
        orchestrator = orchestrator.with_backup(Arc::new(backup_db.store()));
    }

    let event_logger = spawn_event_logger(orchestrator.events());
    let monitor = orchestrator.spawn_monitor(Arc::new(SysinfoProbe::new()), config.monitor.clone());

    let token = orchestrator.cancellation_token();
    let signal_watcher = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown requested, stopping after the current batch");
        token.cancel();
    });

    let mut session = MigrationSession::new(config);
    tracing::info!(
        session_id = %session.id,
        source = %paths.source.display(),
        target = %paths.target.display(),
        dry_run = session.config.dry_run,
        version = BUILD_INFO.version,
        "Starting migration"
    );
    let result = orchestrator.execute(&mut session).await;
    log_store_traffic("source", &source_db.metrics.snapshot());
    log_store_traffic("target", &target_db.metrics.snapshot());

    monitor.shutdown().await;
    signal_watcher.abort();
    event_logger.abort();

    if let Some(backup_db) = backup_db {
        backup_db.close().await;
    }
    source_db.close().await;
    perform_cleanup_actions(&target_db).await;

    let report = result?;
    print_migration_report(&report);
    report.into_result()
}

fn log_store_traffic(store: &str, traffic: &StoreMetricsSnapshot) {
    tracing::info!(
        store,
        queries = traffic.queries_total,
        slow_queries = traffic.queries_slow,
        avg_query_ms = traffic.query_avg_duration_ms,
        p95_ms = traffic.latency_p95_ms,
        rows_read = traffic.rows_read,
        rows_written = traffic.rows_written,
        rows_deleted = traffic.rows_deleted,
        busy_errors = traffic.busy_errors,
        "Store traffic"
    );
}

async fn open_target(paths: &Paths) -> anyhow::Result<DBService> {
    let target_db = DBService::open(&paths.target)
        .await
        .with_context(|| format!("failed to open target {}", paths.target.display()))?;
    if target_db.has_pending_migrations(Schema::Target).await {
        target_db.migrate(Schema::Target).await?;
    }
    Ok(target_db)
}

/// Flush the WAL into the main file, then close the pools.
async fn perform_cleanup_actions(db: &DBService) {
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db.write_pool)
        .await
    {
        tracing::warn!("Failed to checkpoint WAL on shutdown: {}", e);
    }
    db.close().await;
}

/// Mirror bus events into the log until aborted.
fn spawn_event_logger(events: &EventBus) -> JoinHandle<()> {
    let mut stream = events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            log_event(&event);
        }
    })
}

fn log_event(event: &MigrationEvent) {
    match event {
        MigrationEvent::PhaseChanged { phase, .. } => {
            tracing::info!(?phase, "Phase changed");
        }
        MigrationEvent::EntityStarted { entity, total } => {
            tracing::info!(%entity, total, "Migrating entity");
        }
        MigrationEvent::Progress {
            entity,
            processed,
            total,
            migrated,
            failed,
        } => {
            tracing::info!(%entity, processed, total, migrated, failed, "Progress");
        }
        MigrationEvent::BatchCompleted {
            entity,
            batch,
            failed,
            attempts,
            ..
        } if *failed > 0 || *attempts > 1 => {
            tracing::warn!(%entity, batch, failed, attempts, "Batch needed retries or lost records");
        }
        MigrationEvent::EntityFinished {
            entity,
            status,
            migrated,
            failed,
            ..
        } => {
            tracing::info!(%entity, ?status, migrated, failed, "Entity finished");
        }
        MigrationEvent::FindingRaised { finding } => {
            tracing::warn!(
                code = %finding.code,
                severity = ?finding.severity,
                count = finding.count,
                "{}",
                finding.message
            );
        }
        MigrationEvent::AlertRaised { alert } => {
            tracing::warn!(kind = ?alert.kind, value = alert.value, threshold = alert.threshold, "{}", alert.message);
        }
        MigrationEvent::AlertCleared { kind } => {
            tracing::info!(?kind, "Alert cleared");
        }
        MigrationEvent::RollbackStep {
            strategy,
            step,
            entity,
        } => {
            tracing::info!(%strategy, %step, entity = ?entity, "Rollback step");
        }
        MigrationEvent::SessionFinished { session_id, status } => {
            tracing::info!(%session_id, ?status, "Session finished");
        }
        _ => {}
    }
}

/// Waits for Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_migration_report(report: &MigrationReport) {
    println!(
        "Migration {} {:?}{}",
        report.session_id,
        report.status,
        if report.dry_run { " (dry run)" } else { "" }
    );
    println!(
        "{:<16} {:<12} {:>10} {:>10} {:>10}",
        "ENTITY", "STATUS", "TOTAL", "MIGRATED", "FAILED"
    );
    for entity in &report.entities {
        println!(
            "{:<16} {:<12} {:>10} {:>10} {:>10}",
            entity.entity.to_string(),
            format!("{:?}", entity.status),
            entity.total,
            entity.migrated,
            entity.failed
        );
    }
    println!(
        "{} of {} records migrated in {} ms",
        report.stats.migrated_records, report.stats.total_records, report.stats.duration_ms
    );
    for finding in &report.findings {
        println!(
            "  [{:?}] {} ({}): {}",
            finding.severity, finding.code, finding.count, finding.message
        );
    }
    if let Some(rollback) = &report.rollback {
        match (&rollback.report, &rollback.error) {
            (Some(r), _) => println!(
                "Rolled back ({} after {}): {:?}",
                rollback.strategy, rollback.trigger, r.outcome
            ),
            (None, Some(e)) => println!("Rollback could not run: {e}"),
            (None, None) => {}
        }
    }
}

// ============================================================================
// rollback
// ============================================================================

/// Turn the rollback flags into a strategy, rejecting flags that do not
/// apply to the chosen one.
pub fn build_strategy(
    name: Option<&str>,
    tables: &[Entity],
    from: Option<&str>,
    to: Option<&str>,
) -> anyhow::Result<RollbackStrategy> {
    let has_window = from.is_some() || to.is_some();
    let name = match name {
        Some(name) => name.trim().to_ascii_lowercase(),
        None if has_window => "partial".to_string(),
        None => RollbackStrategy::for_trigger(RollbackTrigger::Manual)
            .name()
            .to_string(),
    };

    if name == "partial" {
        let (Some(from), Some(to)) = (from, to) else {
            bail!("partial rollback requires both --from and --to");
        };
        if !tables.is_empty() {
            bail!("--tables only applies to selective rollback");
        }
        return Ok(RollbackStrategy::Partial {
            from: parse_timestamp(from)?,
            to: parse_timestamp(to)?,
        });
    }
    if has_window {
        bail!("--from/--to only apply to partial rollback");
    }

    match name.parse::<RollbackStrategy>()? {
        RollbackStrategy::Selective { .. } if !tables.is_empty() => {
            Ok(RollbackStrategy::Selective {
                tables: Some(tables.to_vec()),
            })
        }
        _ if !tables.is_empty() => bail!("--tables only applies to selective rollback"),
        strategy => Ok(strategy),
    }
}

pub async fn rollback(paths: &Paths, args: RollbackArgs) -> anyhow::Result<RollbackReport> {
    let strategy = build_strategy(
        args.strategy.as_deref(),
        &args.tables,
        args.from.as_deref(),
        args.to.as_deref(),
    )?;
    let last_run = paths.reports.latest_migration()?;

    let entities = if !args.entities.is_empty() {
        args.entities.clone()
    } else if let Some(report) = &last_run {
        report
            .entities
            .iter()
            .filter(|e| e.status != EntityStatus::Pending)
            .map(|e| e.entity)
            .collect()
    } else {
        Entity::ALL.to_vec()
    };
    if entities.is_empty() {
        bail!("nothing to roll back: the last migration touched no entities");
    }

    let _lock = SessionLock::acquire(&paths.target, "rollback")?;
    let target_db = open_target(paths).await?;
    let target = target_db.store();

    let backup_db = if strategy.requires_backup() {
        let backup = match &args.backup {
            Some(filename) => paths.backups.get_backup_path(filename)?,
            None => paths
                .backups
                .latest()?
                .map(|b| b.path)
                .ok_or_else(|| anyhow!("no backups in {}", paths.backups.dir().display()))?,
        };
        tracing::info!(backup = %backup.display(), "Restoring from backup");
        Some(DBService::open_read_only(&backup).await?)
    } else {
        None
    };
    let backup = backup_db.as_ref().map(DBService::store);

    let events = EventBus::new();
    let event_logger = spawn_event_logger(&events);

    let mut engine = RollbackEngine::new(&target)
        .with_events(&events)
        .with_report_writer(Some(&paths.reports));
    if let Some(backup) = &backup {
        engine = engine.with_backup(backup);
    }

    let mut request = RollbackRequest::new(RollbackTrigger::Manual, strategy, entities);
    if let Some(report) = &last_run {
        request = request.for_session(report.session_id, report.started_at);
    }
    let result = engine.execute(request).await;

    event_logger.abort();
    if let Some(backup_db) = backup_db {
        backup_db.close().await;
    }
    perform_cleanup_actions(&target_db).await;

    let report = result?;
    print_rollback_report(&report);
    if report.is_failed() {
        bail!(
            "rollback {} failed: {}",
            report.id,
            report.error.as_deref().unwrap_or("verification found problems")
        );
    }
    Ok(report)
}

fn print_rollback_report(report: &RollbackReport) {
    println!(
        "Rollback {} ({}, {}) {:?} in {} ms",
        report.id, report.strategy, report.trigger, report.outcome, report.duration_ms
    );
    println!(
        "{:<16} {:>10} {:>10} {:>10} {:>10}",
        "ENTITY", "BEFORE", "AFTER", "DELETED", "RESTORED"
    );
    for stats in &report.entities {
        println!(
            "{:<16} {:>10} {:>10} {:>10} {:>10}",
            stats.entity.to_string(),
            stats.before,
            stats.after,
            stats.deleted,
            stats.restored
        );
    }
    for finding in &report.findings {
        println!("  [{:?}] {}: {}", finding.severity, finding.code, finding.message);
    }
}

// ============================================================================
// status / backups
// ============================================================================

pub fn status(paths: &Paths, json: bool) -> anyhow::Result<()> {
    let migration = paths.reports.latest_migration()?;
    let rollback = paths.reports.latest_rollback()?;

    if json {
        let status = serde_json::json!({
            "build": BUILD_INFO,
            "last_migration": migration,
            "last_rollback": rollback,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("catalog-migrate {}", BUILD_INFO.long_version());
    println!("Target: {}", paths.target.display());
    match &migration {
        Some(report) => print_migration_report(report),
        None => println!("No migration has run yet"),
    }
    if let Some(report) = &rollback {
        println!();
        print_rollback_report(report);
    }
    Ok(())
}

pub async fn backups(paths: &Paths, command: BackupCommands) -> anyhow::Result<()> {
    match command {
        BackupCommands::List => {
            let backups = paths.backups.list_backups()?;
            if backups.is_empty() {
                println!("No backups in {}", paths.backups.dir().display());
            }
            for backup in backups {
                println!(
                    "{}  {}  {} bytes",
                    backup.filename,
                    format_timestamp(&backup.created_at),
                    backup.size_bytes
                );
            }
        }
        BackupCommands::Create { keep } => {
            let _lock = SessionLock::acquire(&paths.target, "backup")?;
            let target_db = open_target(paths).await?;
            let created = paths.backups.create_backup(&target_db.write_pool).await;
            perform_cleanup_actions(&target_db).await;
            let info = created?;
            let removed = paths.backups.cleanup_old_backups(keep)?;
            println!("Created {} ({} bytes)", info.filename, info.size_bytes);
            if removed > 0 {
                println!("Removed {removed} old backup(s)");
            }
        }
        BackupCommands::Verify { filename } => {
            let path = match filename {
                Some(filename) => paths.backups.get_backup_path(&filename)?,
                None => paths
                    .backups
                    .latest()?
                    .map(|b| b.path)
                    .ok_or_else(|| anyhow!("no backups in {}", paths.backups.dir().display()))?,
            };
            let backup_db = DBService::open_read_only(&path).await?;
            let verified = backup_db.store().verify_integrity().await;
            backup_db.close().await;
            verified.with_context(|| format!("backup {} failed verification", path.display()))?;
            println!("{} is intact", path.display());
        }
    }
    Ok(())
}
