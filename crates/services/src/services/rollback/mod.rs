//! Rollback engine.
//!
//! Four strategies undo a run: `snapshot` and `selective` restore tables from a
//! backup store, `incremental` and `partial` delete rows by write time. Each
//! strategy takes a checkpoint of the target row counts before touching
//! anything and finishes with an orphaned-reference check.
//!
//! Store calls made here are never retried: a rollback step that fails stops
//! the rollback and is reported as-is.

mod incremental;
mod selective;
mod snapshot;

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use db::{
    BackupStore, PageRequest, RowFilter, StoreError, TargetStore, WriteMode,
    models::{Entity, Table},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::{
    events::{EventBus, MigrationEvent},
    report::{REPORT_VERSION, ReportWriter},
    validation::{FindingKind, Severity, ValidationFinding, check_relationships},
};

/// Rows copied from the backup per insert statement.
pub const RESTORE_PAGE_SIZE: u64 = 1000;

/// Target rows sampled when auto-detecting tables for a selective rollback.
pub const DETECTION_SAMPLE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum RollbackTrigger {
    SystemError,
    DataCorruption,
    ValidationFailure,
    BusinessRuleViolation,
    Timeout,
    Manual,
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackTrigger::SystemError => "SYSTEM_ERROR",
            RollbackTrigger::DataCorruption => "DATA_CORRUPTION",
            RollbackTrigger::ValidationFailure => "VALIDATION_FAILURE",
            RollbackTrigger::BusinessRuleViolation => "BUSINESS_RULE_VIOLATION",
            RollbackTrigger::Timeout => "TIMEOUT",
            RollbackTrigger::Manual => "MANUAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum RollbackStrategy {
    /// Recreate tables and restore them wholesale from the backup.
    Snapshot,
    /// Restore only the given tables, or the ones found to hold orphaned or
    /// invalid rows when `tables` is `None`.
    Selective { tables: Option<Vec<Entity>> },
    /// Delete every row written since the session started.
    Incremental,
    /// Delete rows written in `[from, to)`.
    Partial {
        #[ts(type = "Date")]
        from: DateTime<Utc>,
        #[ts(type = "Date")]
        to: DateTime<Utc>,
    },
}

impl RollbackStrategy {
    /// Strategy used when a failure triggers rollback automatically. Manual
    /// rollbacks without an explicit strategy undo the session incrementally.
    pub fn for_trigger(trigger: RollbackTrigger) -> Self {
        match trigger {
            RollbackTrigger::DataCorruption | RollbackTrigger::SystemError => {
                RollbackStrategy::Snapshot
            }
            RollbackTrigger::ValidationFailure | RollbackTrigger::BusinessRuleViolation => {
                RollbackStrategy::Selective { tables: None }
            }
            RollbackTrigger::Timeout | RollbackTrigger::Manual => RollbackStrategy::Incremental,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RollbackStrategy::Snapshot => "snapshot",
            RollbackStrategy::Selective { .. } => "selective",
            RollbackStrategy::Incremental => "incremental",
            RollbackStrategy::Partial { .. } => "partial",
        }
    }

    pub fn requires_backup(&self) -> bool {
        matches!(
            self,
            RollbackStrategy::Snapshot | RollbackStrategy::Selective { .. }
        )
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses the strategies that need no parameters; `partial` needs a window
/// and is built directly.
impl FromStr for RollbackStrategy {
    type Err = RollbackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(RollbackStrategy::Snapshot),
            "selective" => Ok(RollbackStrategy::Selective { tables: None }),
            "incremental" => Ok(RollbackStrategy::Incremental),
            "partial" => Err(RollbackError::InvalidStrategy(
                "partial rollback requires a --from/--to window".into(),
            )),
            other => Err(RollbackError::InvalidStrategy(format!(
                "unknown strategy '{other}' (valid: snapshot, selective, incremental, partial)"
            ))),
        }
    }
}

/// Target row counts recorded before the first destructive step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RollbackCheckpoint {
    pub id: Uuid,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
    pub strategy: String,
    pub entities: Vec<Entity>,
    #[ts(type = "Date | null")]
    pub since: Option<DateTime<Utc>>,
    #[ts(type = "Date | null")]
    pub until: Option<DateTime<Utc>>,
    pub row_counts: BTreeMap<Entity, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EntityRollbackStats {
    pub entity: Entity,
    pub before: u64,
    pub after: u64,
    pub deleted: u64,
    pub restored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RollbackOutcome {
    Completed,
    CompletedWithWarnings,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RollbackReport {
    pub version: u32,
    pub id: Uuid,
    pub trigger: RollbackTrigger,
    pub strategy: RollbackStrategy,
    pub checkpoint_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    #[ts(type = "Date")]
    pub started_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub entities: Vec<EntityRollbackStats>,
    pub outcome: RollbackOutcome,
    pub findings: Vec<ValidationFinding>,
    pub error: Option<String>,
}

impl RollbackReport {
    pub fn is_failed(&self) -> bool {
        self.outcome == RollbackOutcome::Failed
    }
}

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("invalid rollback strategy: {0}")]
    InvalidStrategy(String),
    #[error("{0} rollback requires a backup store")]
    BackupRequired(&'static str),
    #[error("backup integrity check failed: {0}")]
    BackupIntegrity(#[source] StoreError),
    #[error("rollback step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StoreError,
    },
}

impl RollbackError {
    fn step(step: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let step = step.into();
        move |source| RollbackError::Step { step, source }
    }
}

/// What to roll back and why.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub trigger: RollbackTrigger,
    pub strategy: RollbackStrategy,
    pub session_id: Option<Uuid>,
    /// Start of the session being undone; required by `incremental`.
    pub session_start: Option<DateTime<Utc>>,
    /// Entities the rollback may touch, in any order.
    pub entities: Vec<Entity>,
}

impl RollbackRequest {
    pub fn new(trigger: RollbackTrigger, strategy: RollbackStrategy, entities: Vec<Entity>) -> Self {
        Self {
            trigger,
            strategy,
            session_id: None,
            session_start: None,
            entities,
        }
    }

    pub fn for_session(mut self, session_id: Uuid, started_at: DateTime<Utc>) -> Self {
        self.session_id = Some(session_id);
        self.session_start = Some(started_at);
        self
    }

    /// Reject selections that cannot run, before any I/O.
    fn validate(&self, has_backup: bool) -> Result<(), RollbackError> {
        match &self.strategy {
            RollbackStrategy::Partial { from, to } if from >= to => {
                return Err(RollbackError::InvalidStrategy(format!(
                    "partial window start {from} is not before its end {to}"
                )));
            }
            RollbackStrategy::Incremental if self.session_start.is_none() => {
                return Err(RollbackError::InvalidStrategy(
                    "incremental rollback needs the session start time".into(),
                ));
            }
            _ => {}
        }
        if self.strategy.requires_backup() && !has_backup {
            return Err(RollbackError::BackupRequired(self.strategy.name()));
        }
        if self.entities.is_empty() {
            return Err(RollbackError::InvalidStrategy("no entities to roll back".into()));
        }
        Ok(())
    }
}

/// Per-entity bookkeeping shared by the strategies.
struct RollbackProgress {
    stats: BTreeMap<Entity, EntityRollbackStats>,
    findings: Vec<ValidationFinding>,
}

impl RollbackProgress {
    fn new(checkpoint: &RollbackCheckpoint) -> Self {
        let stats = checkpoint
            .row_counts
            .iter()
            .map(|(&entity, &before)| {
                (
                    entity,
                    EntityRollbackStats {
                        entity,
                        before,
                        after: before,
                        deleted: 0,
                        restored: 0,
                    },
                )
            })
            .collect();
        Self {
            stats,
            findings: Vec::new(),
        }
    }

    fn entry(&mut self, entity: Entity) -> &mut EntityRollbackStats {
        self.stats.entry(entity).or_insert(EntityRollbackStats {
            entity,
            before: 0,
            after: 0,
            deleted: 0,
            restored: 0,
        })
    }
}

/// Entities ordered parents first. Declaration order of [`Entity`] is a
/// valid dependency order for the target schema.
fn parents_first(entities: &[Entity]) -> Vec<Entity> {
    let mut ordered = entities.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

fn children_first(entities: &[Entity]) -> Vec<Entity> {
    let mut ordered = parents_first(entities);
    ordered.reverse();
    ordered
}

pub struct RollbackEngine<'a> {
    target: &'a dyn TargetStore,
    backup: Option<&'a dyn BackupStore>,
    events: Option<&'a EventBus>,
    reports: Option<&'a ReportWriter>,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(target: &'a dyn TargetStore) -> Self {
        Self {
            target,
            backup: None,
            events: None,
            reports: None,
        }
    }

    pub fn with_backup(mut self, backup: &'a dyn BackupStore) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_events(mut self, events: &'a EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_report_writer(mut self, reports: Option<&'a ReportWriter>) -> Self {
        self.reports = reports;
        self
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Run `request` to completion.
    ///
    /// Invalid selections are rejected with an error before any I/O. Once the
    /// rollback has started, failures end it with a report whose outcome is
    /// [`RollbackOutcome::Failed`].
    pub async fn execute(&self, request: RollbackRequest) -> Result<RollbackReport, RollbackError> {
        request.validate(self.backup.is_some())?;

        let started_at = Utc::now();
        info!(
            trigger = %request.trigger,
            strategy = %request.strategy,
            entities = request.entities.len(),
            "Starting rollback"
        );

        let (checkpoint_id, mut progress, result) = match self.checkpoint(&request).await {
            Ok(checkpoint) => {
                let mut progress = RollbackProgress::new(&checkpoint);
                let result = self.run_strategy(&request, &mut progress).await;
                (Some(checkpoint.id), progress, result)
            }
            Err(e) => (
                None,
                RollbackProgress {
                    stats: BTreeMap::new(),
                    findings: Vec::new(),
                },
                Err(e),
            ),
        };

        if result.is_ok() {
            self.verify(&mut progress).await;
        }

        let error = result.err().map(|e| {
            error!(strategy = %request.strategy, error = %e, "Rollback failed");
            e.to_string()
        });
        let outcome = if error.is_some()
            || progress.findings.iter().any(ValidationFinding::is_critical)
        {
            RollbackOutcome::Failed
        } else if progress.findings.is_empty() {
            RollbackOutcome::Completed
        } else {
            RollbackOutcome::CompletedWithWarnings
        };

        let finished_at = Utc::now();
        let report = RollbackReport {
            version: REPORT_VERSION,
            id: Uuid::new_v4(),
            trigger: request.trigger,
            strategy: request.strategy.clone(),
            checkpoint_id,
            session_id: request.session_id,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            entities: progress.stats.into_values().collect(),
            outcome,
            findings: progress.findings,
            error,
        };

        info!(
            strategy = %report.strategy,
            outcome = ?report.outcome,
            duration_ms = report.duration_ms,
            findings = report.findings.len(),
            "Rollback finished"
        );
        self.publish(&request.strategy, format!("finished: {:?}", report.outcome), None);

        if let Some(reports) = self.reports
            && let Err(e) = reports.write_rollback(&report)
        {
            warn!(error = %e, "Failed to write rollback report");
        }
        Ok(report)
    }

    async fn checkpoint(&self, request: &RollbackRequest) -> Result<RollbackCheckpoint, RollbackError> {
        let entities = parents_first(&request.entities);
        let mut row_counts = BTreeMap::new();
        for &entity in &entities {
            let count = self
                .target
                .count(Table::Target(entity), RowFilter::All)
                .await
                .map_err(RollbackError::step(format!("checkpoint {entity}")))?;
            row_counts.insert(entity, count);
        }

        let (since, until) = match &request.strategy {
            RollbackStrategy::Incremental => (request.session_start, None),
            RollbackStrategy::Partial { from, to } => (Some(*from), Some(*to)),
            _ => (None, None),
        };
        let checkpoint = RollbackCheckpoint {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            strategy: request.strategy.name().to_string(),
            entities,
            since,
            until,
            row_counts,
        };
        info!(checkpoint_id = %checkpoint.id, "Rollback checkpoint created");
        self.publish(&request.strategy, format!("checkpoint {}", checkpoint.id), None);
        Ok(checkpoint)
    }

    async fn run_strategy(
        &self,
        request: &RollbackRequest,
        progress: &mut RollbackProgress,
    ) -> Result<(), RollbackError> {
        match &request.strategy {
            RollbackStrategy::Snapshot => {
                let backup = self.backup.ok_or(RollbackError::BackupRequired("snapshot"))?;
                snapshot::run(self, backup, &request.entities, progress).await
            }
            RollbackStrategy::Selective { tables } => {
                let backup = self.backup.ok_or(RollbackError::BackupRequired("selective"))?;
                selective::run(self, backup, tables.as_deref(), &request.entities, progress).await
            }
            RollbackStrategy::Incremental => {
                let since = request.session_start.ok_or_else(|| {
                    RollbackError::InvalidStrategy("incremental rollback needs the session start time".into())
                })?;
                incremental::run(
                    self,
                    &request.strategy,
                    RowFilter::CreatedSince(since),
                    &request.entities,
                    progress,
                )
                .await
            }
            RollbackStrategy::Partial { from, to } => {
                incremental::run(
                    self,
                    &request.strategy,
                    RowFilter::CreatedBetween {
                        from: *from,
                        to: *to,
                    },
                    &request.entities,
                    progress,
                )
                .await
            }
        }
    }

    /// Final integrity check: no orphaned references anywhere in the target.
    async fn verify(&self, progress: &mut RollbackProgress) {
        for (&entity, stats) in progress.stats.iter_mut() {
            match self.target.count(Table::Target(entity), RowFilter::All).await {
                Ok(after) => stats.after = after,
                Err(e) => warn!(entity = %entity, error = %e, "Failed to count rows after rollback"),
            }
        }

        match check_relationships(self.target, &Entity::ALL).await {
            Ok(orphans) => progress
                .findings
                .extend(orphans.into_iter().map(|mut f| {
                    f.kind = FindingKind::RollbackVerification;
                    f
                })),
            Err(e) => progress.findings.push(ValidationFinding::new(
                FindingKind::RollbackVerification,
                "ROLLBACK_VERIFICATION_FAILED",
                Severity::Critical,
                format!("integrity check after rollback failed: {e}"),
            )),
        }
    }

    fn publish(&self, strategy: &RollbackStrategy, step: impl Into<String>, entity: Option<Entity>) {
        if let Some(events) = self.events {
            events.publish(MigrationEvent::RollbackStep {
                strategy: strategy.name().to_string(),
                step: step.into(),
                entity,
            });
        }
    }

    /// Copy every backup row of `entity` into the target, returning the
    /// number of rows restored.
    async fn restore_from_backup(
        &self,
        backup: &dyn BackupStore,
        entity: Entity,
    ) -> Result<u64, RollbackError> {
        let table = Table::Target(entity);
        let mut offset = 0;
        loop {
            let rows = backup
                .fetch_page(table, PageRequest::for_table(table, offset, RESTORE_PAGE_SIZE))
                .await
                .map_err(RollbackError::step(format!("read backup {entity}")))?;
            if rows.is_empty() {
                break;
            }
            self.target
                .insert_batch(table, &rows, WriteMode::Insert)
                .await
                .map_err(RollbackError::step(format!("restore {entity}")))?;
            offset += rows.len() as u64;
            if (rows.len() as u64) < RESTORE_PAGE_SIZE {
                break;
            }
        }
        Ok(offset)
    }

    /// Record-count parity between target and backup after a restore.
    async fn check_parity(
        &self,
        backup: &dyn BackupStore,
        entity: Entity,
        progress: &mut RollbackProgress,
    ) -> Result<(), RollbackError> {
        let table = Table::Target(entity);
        let expected = backup
            .count(table, RowFilter::All)
            .await
            .map_err(RollbackError::step(format!("count backup {entity}")))?;
        let actual = self
            .target
            .count(table, RowFilter::All)
            .await
            .map_err(RollbackError::step(format!("count {entity}")))?;
        if expected != actual {
            progress.findings.push(
                ValidationFinding::new(
                    FindingKind::RollbackVerification,
                    "ROLLBACK_PARITY_MISMATCH",
                    Severity::Critical,
                    format!("{entity}: backup holds {expected} rows, target holds {actual}"),
                )
                .for_entity(entity)
                .with_count(expected.abs_diff(actual)),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_strategy_for_trigger() {
        assert_eq!(
            RollbackStrategy::for_trigger(RollbackTrigger::DataCorruption),
            RollbackStrategy::Snapshot
        );
        assert_eq!(
            RollbackStrategy::for_trigger(RollbackTrigger::SystemError),
            RollbackStrategy::Snapshot
        );
        assert_eq!(
            RollbackStrategy::for_trigger(RollbackTrigger::ValidationFailure),
            RollbackStrategy::Selective { tables: None }
        );
        assert_eq!(
            RollbackStrategy::for_trigger(RollbackTrigger::BusinessRuleViolation),
            RollbackStrategy::Selective { tables: None }
        );
        assert_eq!(
            RollbackStrategy::for_trigger(RollbackTrigger::Timeout),
            RollbackStrategy::Incremental
        );
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Snapshot".parse::<RollbackStrategy>().unwrap(), RollbackStrategy::Snapshot);
        assert!(matches!(
            "partial".parse::<RollbackStrategy>(),
            Err(RollbackError::InvalidStrategy(_))
        ));
        assert!("restore".parse::<RollbackStrategy>().is_err());
    }

    #[test]
    fn test_request_validation() {
        let now = Utc::now();
        let partial = RollbackRequest::new(
            RollbackTrigger::Manual,
            RollbackStrategy::Partial { from: now, to: now },
            vec![Entity::Customers],
        );
        assert!(matches!(
            partial.validate(true),
            Err(RollbackError::InvalidStrategy(_))
        ));

        let snapshot = RollbackRequest::new(
            RollbackTrigger::Manual,
            RollbackStrategy::Snapshot,
            vec![Entity::Customers],
        );
        assert!(matches!(
            snapshot.validate(false),
            Err(RollbackError::BackupRequired("snapshot"))
        ));
        assert!(snapshot.validate(true).is_ok());

        let incremental = RollbackRequest::new(
            RollbackTrigger::Timeout,
            RollbackStrategy::Incremental,
            vec![Entity::Customers],
        );
        assert!(incremental.validate(false).is_err());
        assert!(
            incremental
                .for_session(Uuid::new_v4(), now - Duration::minutes(5))
                .validate(false)
                .is_ok()
        );
    }

    #[test]
    fn test_dependency_ordering_helpers() {
        let entities = [Entity::Inventory, Entity::Suppliers, Entity::Products];
        assert_eq!(
            parents_first(&entities),
            vec![Entity::Suppliers, Entity::Products, Entity::Inventory]
        );
        assert_eq!(
            children_first(&entities),
            vec![Entity::Inventory, Entity::Products, Entity::Suppliers]
        );
    }
}
