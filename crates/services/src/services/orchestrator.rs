//! Runs a migration session end to end.
//!
//! Order of work: plan, pre-migration gate, entities in dependency order,
//! post-migration gate, then rollback when something critical went wrong.
//! A report is produced for every run that got past planning.

use std::sync::Arc;

use db::{BackupStore, StoreReader, TargetStore, models::Entity};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    batch_processor::{BatchError, BatchProcessor},
    config::MonitorConfig,
    events::{EventBus, MigrationEvent},
    plan::{MigrationPlan, OrchestrationError},
    progress_monitor::{ProgressMonitor, ProgressMonitorHandle, SystemProbe},
    report::{MigrationReport, ReportWriter, RollbackSummary},
    rollback::{RollbackEngine, RollbackRequest, RollbackStrategy, RollbackTrigger},
    session::{EntityStatus, MigrationPhase, MigrationSession, SessionSnapshot},
    transform::transform_record,
    validation::{
        FindingKind, Severity, ValidationFinding, has_critical, pre_gate::PreGateOptions,
        run_post_migration, run_pre_migration,
    },
};

pub struct MigrationOrchestrator {
    source: Arc<dyn StoreReader>,
    target: Arc<dyn TargetStore>,
    backup: Option<Arc<dyn BackupStore>>,
    events: EventBus,
    cancel: CancellationToken,
    status: watch::Sender<SessionSnapshot>,
    reports: Option<ReportWriter>,
}

impl MigrationOrchestrator {
    pub fn new(source: Arc<dyn StoreReader>, target: Arc<dyn TargetStore>) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::idle());
        Self {
            source,
            target,
            backup: None,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            status,
            reports: None,
        }
    }

    /// Backup used by snapshot and selective rollback.
    pub fn with_backup(mut self, backup: Arc<dyn BackupStore>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_report_writer(mut self, reports: ReportWriter) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Cancelling the token stops the run at the next batch boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }

    /// Start a progress monitor observing this orchestrator's sessions.
    pub fn spawn_monitor(
        &self,
        probe: Arc<dyn SystemProbe>,
        config: MonitorConfig,
    ) -> ProgressMonitorHandle {
        ProgressMonitor::spawn(
            self.subscribe_status(),
            self.target.clone(),
            probe,
            self.events.clone(),
            config,
        )
    }

    /// Run `session` to completion.
    ///
    /// Only configuration errors found before any I/O are returned as
    /// errors; every other outcome, including failures, is a report.
    /// Entities already completed in `session` are skipped, so a session
    /// returned from a failed run can be passed in again to resume it.
    pub async fn execute(
        &self,
        session: &mut MigrationSession,
    ) -> Result<MigrationReport, OrchestrationError> {
        session.config.validate()?;
        let plan = MigrationPlan::build(&session.config.entities)?;
        session.reorder(&plan.order);
        session.finished_at = None;
        let config = session.config.clone();

        info!(
            session_id = %session.id,
            entities = ?plan.order,
            dry_run = config.dry_run,
            batch_size = config.batch_size,
            write_mode = ?config.write_mode,
            "Starting migration"
        );
        self.events.publish(MigrationEvent::SessionStarted {
            session_id: session.id,
            dry_run: config.dry_run,
            entities: plan.order.clone(),
        });

        let pending: Vec<Entity> = session
            .entities
            .iter()
            .filter(|e| e.status != EntityStatus::Completed)
            .map(|e| e.entity)
            .collect();

        self.set_phase(session, MigrationPhase::PreValidation, None);
        let findings = run_pre_migration(
            &*self.source,
            &*self.target,
            &pending,
            &PreGateOptions::from(&config),
        )
        .await;
        let halted = has_critical(&findings);
        self.raise_all(session, findings);
        if halted {
            warn!(session_id = %session.id, "Pre-migration validation failed, nothing was written");
            let error = "pre-migration validation found critical issues".to_string();
            return Ok(self.finish(session, Some(error), None));
        }

        self.set_phase(session, MigrationPhase::Migrating, None);
        let (error, trigger) = self.migrate_entities(session, &plan).await;

        let mut trigger = trigger;
        if error.is_none() {
            self.set_phase(session, MigrationPhase::PostValidation, None);
            let findings = run_post_migration(
                &*self.target,
                &session.entities,
                config.dry_run,
                config.validation_sample_size,
            )
            .await;
            if has_critical(&findings) {
                trigger = Some(RollbackTrigger::ValidationFailure);
            }
            self.raise_all(session, findings);
        }

        let rollback = match trigger {
            Some(trigger) if config.rollback_on_failure && !config.dry_run => {
                Some(self.rollback(session, trigger).await)
            }
            Some(trigger) => {
                info!(trigger = %trigger, dry_run = config.dry_run, "Automatic rollback disabled");
                None
            }
            None => None,
        };

        Ok(self.finish(session, error, rollback))
    }

    /// Run every entity in plan order. Returns the error that stopped the run
    /// and the rollback it calls for.
    async fn migrate_entities(
        &self,
        session: &mut MigrationSession,
        plan: &MigrationPlan,
    ) -> (Option<String>, Option<RollbackTrigger>) {
        let config = session.config.clone();
        let deadline = Instant::now() + config.pipeline_timeout();
        let processor = BatchProcessor::new(&*self.source, &*self.target, &config, &self.events)
            .with_cancellation(self.cancel.clone())
            .with_deadline(deadline)
            .with_status(&self.status);

        for &entity in &plan.order {
            let Some(state) = session.entity_mut(entity) else {
                continue;
            };
            match state.status {
                EntityStatus::Completed => {
                    info!(entity = %entity, "Entity already completed, skipping");
                    continue;
                }
                EntityStatus::Failed | EntityStatus::InProgress => state.prepare_resume(),
                EntityStatus::Pending => {}
            }

            self.status.send_modify(|snapshot| snapshot.current_entity = Some(entity));
            let result = processor
                .migrate_entity(state, |row, lookups, at| {
                    transform_record(entity, row, lookups, at)
                })
                .await;

            if let Err(e) = result {
                let (finding, trigger) = match &e {
                    BatchError::Cancelled => (
                        ValidationFinding::new(
                            FindingKind::Cancelled,
                            "MIGRATION_CANCELLED",
                            Severity::Critical,
                            format!("migration cancelled by operator during {entity}"),
                        ),
                        None,
                    ),
                    BatchError::DeadlineExceeded => (
                        ValidationFinding::new(
                            FindingKind::Timeout,
                            "PIPELINE_TIMEOUT",
                            Severity::Critical,
                            format!(
                                "pipeline deadline of {}s exceeded during {entity}",
                                config.pipeline_timeout_secs
                            ),
                        ),
                        Some(RollbackTrigger::Timeout),
                    ),
                    other => (
                        ValidationFinding::new(
                            FindingKind::EntityFailed,
                            "ENTITY_MIGRATION_FAILED",
                            Severity::Critical,
                            other.to_string(),
                        ),
                        Some(RollbackTrigger::SystemError),
                    ),
                };
                self.raise(session, finding.for_entity(entity));
                return (Some(e.to_string()), trigger);
            }
        }
        (None, None)
    }

    async fn rollback(&self, session: &mut MigrationSession, trigger: RollbackTrigger) -> RollbackSummary {
        self.set_phase(session, MigrationPhase::RollingBack, None);

        let mut strategy = RollbackStrategy::for_trigger(trigger);
        if strategy.requires_backup() && self.backup.is_none() {
            self.raise(
                session,
                ValidationFinding::new(
                    FindingKind::RollbackVerification,
                    "ROLLBACK_FALLBACK",
                    Severity::Warning,
                    format!("no backup configured for {strategy} rollback, falling back to incremental"),
                ),
            );
            strategy = RollbackStrategy::Incremental;
        }

        let entities = session.attempted_entities();
        info!(
            session_id = %session.id,
            trigger = %trigger,
            strategy = %strategy,
            entities = ?entities,
            "Rolling back migration"
        );

        let mut engine = RollbackEngine::new(&*self.target)
            .with_events(&self.events)
            .with_report_writer(self.reports.as_ref());
        if let Some(backup) = &self.backup {
            engine = engine.with_backup(backup.as_ref());
        }
        let request = RollbackRequest::new(trigger, strategy.clone(), entities)
            .for_session(session.id, session.started_at);

        match engine.execute(request).await {
            Ok(report) => {
                if let Some(error) = &report.error {
                    warn!(error = %error, "Rollback did not complete");
                }
                RollbackSummary {
                    strategy: strategy.name().to_string(),
                    trigger,
                    report: Some(report),
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Rollback rejected");
                RollbackSummary {
                    strategy: strategy.name().to_string(),
                    trigger,
                    report: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn finish(
        &self,
        session: &mut MigrationSession,
        error: Option<String>,
        rollback: Option<RollbackSummary>,
    ) -> MigrationReport {
        let report = MigrationReport::from_session(session, error, rollback);
        let phase = if report.is_success() {
            MigrationPhase::Completed
        } else {
            MigrationPhase::Failed
        };
        self.set_phase(session, phase, None);
        self.events.publish(MigrationEvent::SessionFinished {
            session_id: session.id,
            status: report.status,
        });

        info!(
            session_id = %report.session_id,
            status = ?report.status,
            migrated = report.stats.migrated_records,
            failed = report.stats.failed_records,
            findings = report.findings.len(),
            duration_ms = report.stats.duration_ms,
            "Migration finished"
        );

        if let Some(reports) = &self.reports
            && let Err(e) = reports.write_migration(&report)
        {
            warn!(error = %e, "Failed to write migration report");
        }
        report
    }

    fn set_phase(&self, session: &MigrationSession, phase: MigrationPhase, current: Option<Entity>) {
        self.status.send_replace(session.snapshot(phase, current));
        self.events.publish(MigrationEvent::PhaseChanged {
            session_id: session.id,
            phase,
        });
    }

    fn raise(&self, session: &mut MigrationSession, finding: ValidationFinding) {
        match finding.severity {
            Severity::Critical => warn!(code = %finding.code, count = finding.count, "{}", finding.message),
            _ => info!(code = %finding.code, count = finding.count, "{}", finding.message),
        }
        self.events.publish(MigrationEvent::FindingRaised {
            finding: finding.clone(),
        });
        session.findings.push(finding);
    }

    fn raise_all(&self, session: &mut MigrationSession, findings: Vec<ValidationFinding>) {
        for finding in findings {
            self.raise(session, finding);
        }
    }
}
