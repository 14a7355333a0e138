//! Per-run state: the session, its entity states and aggregate stats.
//!
//! A [`MigrationSession`] is a plain value passed by `&mut` through the
//! pipeline; the only shared view of it is the [`SessionSnapshot`] published
//! on a watch channel for the progress monitor.

use chrono::{DateTime, Utc};
use db::models::Entity;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use super::{config::MigrationConfig, validation::ValidationFinding};

/// Record failures kept per entity for the report.
pub const MAX_FAILURE_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EntityStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MigrationPhase {
    #[default]
    Planning,
    PreValidation,
    Migrating,
    PostValidation,
    RollingBack,
    Completed,
    Failed,
}

/// Why one legacy record (or a whole batch) did not reach the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RecordFailure {
    /// Legacy id, absent for batch-level failures.
    pub source_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EntityMigrationState {
    pub entity: Entity,
    pub dependencies: Vec<Entity>,
    pub status: EntityStatus,
    pub total: u64,
    pub migrated: u64,
    /// Migrated records that updated an existing target row instead of adding one.
    #[serde(default)]
    pub merged: u64,
    pub failed: u64,
    /// Source rows consumed so far; a resumed entity continues from here.
    pub cursor_offset: u64,
    pub batches_processed: u64,
    pub retries: u64,
    /// Rows counted as failed only because the entity aborted before reading them.
    pub aborted_rows: u64,
    pub failure_samples: Vec<RecordFailure>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityMigrationState {
    pub fn new(entity: Entity, dependencies: Vec<Entity>) -> Self {
        Self {
            entity,
            dependencies,
            status: EntityStatus::Pending,
            total: 0,
            migrated: 0,
            merged: 0,
            failed: 0,
            cursor_offset: 0,
            batches_processed: 0,
            retries: 0,
            aborted_rows: 0,
            failure_samples: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn processed(&self) -> u64 {
        self.migrated + self.failed
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed())
    }

    /// Failed share of processed records, 0.0 before anything was processed.
    pub fn failure_rate(&self) -> f64 {
        match self.processed() {
            0 => 0.0,
            processed => self.failed as f64 / processed as f64,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EntityStatus::Completed | EntityStatus::Failed)
    }

    pub fn record_failure(&mut self, failure: RecordFailure) {
        if self.failure_samples.len() < MAX_FAILURE_SAMPLES {
            self.failure_samples.push(failure);
        }
    }

    /// Close out an aborted entity: unread rows count as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let remaining = self.remaining();
        self.failed += remaining;
        self.aborted_rows += remaining;
        self.status = EntityStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Undo the bookkeeping of an abort so the entity continues from its cursor.
    pub fn prepare_resume(&mut self) {
        self.failed -= self.aborted_rows.min(self.failed);
        self.aborted_rows = 0;
        self.status = EntityStatus::Pending;
        self.error = None;
        self.finished_at = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MigrationStats {
    pub total_records: u64,
    pub migrated_records: u64,
    pub failed_records: u64,
    pub entities_completed: u64,
    pub entities_failed: u64,
    pub batches: u64,
    pub retries: u64,
    pub duration_ms: u64,
}

impl MigrationStats {
    pub fn from_states(states: &[EntityMigrationState], duration_ms: u64) -> Self {
        let mut stats = Self {
            duration_ms,
            ..Default::default()
        };
        for state in states {
            stats.total_records += state.total;
            stats.migrated_records += state.migrated;
            stats.failed_records += state.failed;
            stats.batches += state.batches_processed;
            stats.retries += state.retries;
            match state.status {
                EntityStatus::Completed => stats.entities_completed += 1,
                EntityStatus::Failed => stats.entities_failed += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Read-only view of a running session, published on every batch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub phase: MigrationPhase,
    pub current_entity: Option<Entity>,
    pub entities: Vec<EntityMigrationState>,
    pub captured_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: Uuid::nil(),
            phase: MigrationPhase::Planning,
            current_entity: None,
            entities: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// Replace the state of `state.entity`, appending it if unseen.
    pub fn update_entity(&mut self, state: &EntityMigrationState) {
        let mut state = state.clone();
        state.failure_samples.clear();
        match self.entities.iter_mut().find(|e| e.entity == state.entity) {
            Some(existing) => *existing = state,
            None => self.entities.push(state),
        }
        self.captured_at = Utc::now();
    }

    pub fn processed(&self) -> u64 {
        self.entities.iter().map(EntityMigrationState::processed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.entities.iter().map(|e| e.failed).sum()
    }

    pub fn migrated(&self) -> u64 {
        self.entities.iter().map(|e| e.migrated).sum()
    }

    pub fn remaining(&self) -> u64 {
        self.entities.iter().map(EntityMigrationState::remaining).sum()
    }
}

/// One end-to-end migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: MigrationConfig,
    pub entities: Vec<EntityMigrationState>,
    pub stats: MigrationStats,
    pub findings: Vec<ValidationFinding>,
}

impl MigrationSession {
    pub fn new(config: MigrationConfig) -> Self {
        let entities = config
            .entities
            .iter()
            .map(|e| EntityMigrationState::new(e.entity, e.dependencies.clone()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            config,
            entities,
            stats: MigrationStats::default(),
            findings: Vec::new(),
        }
    }

    pub fn entity(&self, entity: Entity) -> Option<&EntityMigrationState> {
        self.entities.iter().find(|e| e.entity == entity)
    }

    pub fn entity_mut(&mut self, entity: Entity) -> Option<&mut EntityMigrationState> {
        self.entities.iter_mut().find(|e| e.entity == entity)
    }

    /// Reorder entity states to follow `order`; states not in `order` keep
    /// their relative position at the end.
    pub fn reorder(&mut self, order: &[Entity]) {
        self.entities.sort_by_key(|state| {
            order
                .iter()
                .position(|e| *e == state.entity)
                .unwrap_or(usize::MAX)
        });
    }

    /// Entities this run touched, in migration order.
    pub fn attempted_entities(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.status != EntityStatus::Pending)
            .map(|e| e.entity)
            .collect()
    }

    pub fn snapshot(&self, phase: MigrationPhase, current_entity: Option<Entity>) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot {
            session_id: self.id,
            phase,
            current_entity,
            entities: Vec::with_capacity(self.entities.len()),
            captured_at: Utc::now(),
        };
        for state in &self.entities {
            snapshot.update_entity(state);
        }
        snapshot
    }

    pub fn refresh_stats(&mut self) {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        let duration_ms = (end - self.started_at).num_milliseconds().max(0) as u64;
        self.stats = MigrationStats::from_states(&self.entities, duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: u64, migrated: u64, failed: u64) -> EntityMigrationState {
        EntityMigrationState {
            total,
            migrated,
            failed,
            ..EntityMigrationState::new(Entity::Customers, vec![])
        }
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(state(10, 0, 0).failure_rate(), 0.0);
        assert_eq!(state(10, 3, 1).failure_rate(), 0.25);
    }

    #[test]
    fn test_mark_failed_closes_counters() {
        let mut s = state(100, 40, 2);
        s.mark_failed("boom");
        assert_eq!(s.status, EntityStatus::Failed);
        assert_eq!(s.migrated + s.failed, s.total);
        assert_eq!(s.aborted_rows, 58);

        s.prepare_resume();
        assert_eq!(s.failed, 2);
        assert_eq!(s.remaining(), 58);
        assert_eq!(s.status, EntityStatus::Pending);
    }

    #[test]
    fn test_failure_samples_are_bounded() {
        let mut s = state(100, 0, 0);
        for id in 0..50 {
            s.record_failure(RecordFailure {
                source_id: Some(id),
                reason: "bad".into(),
            });
        }
        assert_eq!(s.failure_samples.len(), MAX_FAILURE_SAMPLES);
    }

    #[test]
    fn test_stats_from_states() {
        let mut a = state(10, 10, 0);
        a.status = EntityStatus::Completed;
        a.batches_processed = 1;
        let mut b = state(5, 2, 3);
        b.status = EntityStatus::Failed;
        b.retries = 2;

        let stats = MigrationStats::from_states(&[a, b], 42);
        assert_eq!(stats.total_records, 15);
        assert_eq!(stats.migrated_records, 12);
        assert_eq!(stats.failed_records, 3);
        assert_eq!(stats.entities_completed, 1);
        assert_eq!(stats.entities_failed, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.duration_ms, 42);
    }

    #[test]
    fn test_reorder_and_snapshot() {
        let mut session = MigrationSession::new(MigrationConfig::default());
        session.reorder(&[Entity::Customers, Entity::Suppliers]);
        assert_eq!(session.entities[0].entity, Entity::Customers);
        assert_eq!(session.entities[1].entity, Entity::Suppliers);

        session.entity_mut(Entity::Customers).unwrap().migrated = 7;
        let snapshot = session.snapshot(MigrationPhase::Migrating, Some(Entity::Customers));
        assert_eq!(snapshot.session_id, session.id);
        assert_eq!(snapshot.migrated(), 7);
        assert_eq!(snapshot.entities.len(), session.entities.len());
    }

    #[test]
    fn test_snapshot_update_drops_failure_samples() {
        let mut s = state(10, 1, 1);
        s.record_failure(RecordFailure {
            source_id: Some(1),
            reason: "bad".into(),
        });
        let mut snapshot = SessionSnapshot::idle();
        snapshot.update_entity(&s);
        snapshot.update_entity(&s);
        assert_eq!(snapshot.entities.len(), 1);
        assert!(snapshot.entities[0].failure_samples.is_empty());
        assert_eq!(snapshot.processed(), 2);
    }
}
