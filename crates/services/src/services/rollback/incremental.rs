use db::{
    RowFilter, TargetStore,
    models::{Entity, Table},
};
use tracing::info;

use super::{RollbackEngine, RollbackError, RollbackProgress, RollbackStrategy, children_first};

/// Delete the rows matching `filter` from every entity, children first.
/// Shared by `incremental` (rows since the session start) and `partial`
/// (rows inside an operator window).
pub(super) async fn run(
    engine: &RollbackEngine<'_>,
    strategy: &RollbackStrategy,
    filter: RowFilter,
    entities: &[Entity],
    progress: &mut RollbackProgress,
) -> Result<(), RollbackError> {
    let target: &dyn TargetStore = engine.target;

    for entity in children_first(entities) {
        let deleted = target
            .delete_rows(Table::Target(entity), filter)
            .await
            .map_err(RollbackError::step(format!("delete {entity}")))?;
        progress.entry(entity).deleted = deleted;
        info!(entity = %entity, deleted, strategy = %strategy, "Rolled back rows");
        engine.publish(strategy, format!("deleted {deleted} rows"), Some(entity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use db::{MemoryStore, Row, validation::format_timestamp};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::services::{
        events::{EventBus, MigrationEvent},
        rollback::{RollbackError, RollbackOutcome, RollbackRequest, RollbackTrigger},
    };

    fn customer(id: i64, created_at: DateTime<Utc>) -> Row {
        json!({
            "id": id,
            "code": format!("C{id}"),
            "name": "Customer",
            "created_at": format_timestamp(&created_at),
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[tokio::test]
    async fn test_incremental_removes_only_session_rows() {
        let session_start: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().unwrap();
        let target = MemoryStore::with_target_schema();
        target.seed(
            Table::Target(Entity::Customers),
            [
                customer(1, session_start - Duration::days(3)),
                customer(2, session_start - Duration::seconds(1)),
                customer(3, session_start),
                customer(4, session_start + Duration::minutes(5)),
            ],
        );
        let events = EventBus::new();
        let engine = RollbackEngine::new(&target).with_events(&events);
        let request = RollbackRequest::new(
            RollbackTrigger::Timeout,
            RollbackStrategy::Incremental,
            vec![Entity::Customers],
        )
        .for_session(Uuid::new_v4(), session_start);

        let report = engine.execute(request).await.unwrap();

        assert_eq!(report.outcome, RollbackOutcome::Completed);
        let remaining: Vec<_> = target
            .rows(Table::Target(Entity::Customers))
            .iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(remaining, vec![1, 2]);
        assert_eq!(report.entities[0].deleted, 2);
        assert!(
            events.history().iter().any(|e| matches!(
                e,
                MigrationEvent::RollbackStep {
                    entity: Some(Entity::Customers),
                    ..
                }
            ))
        );
    }

    #[tokio::test]
    async fn test_partial_respects_window() {
        let base: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
        let target = MemoryStore::with_target_schema();
        target.seed(
            Table::Target(Entity::Customers),
            (0..6).map(|i| customer(i, base + Duration::minutes(10 * i))),
        );
        let engine = RollbackEngine::new(&target);
        let request = RollbackRequest::new(
            RollbackTrigger::Manual,
            RollbackStrategy::Partial {
                from: base + Duration::minutes(10),
                to: base + Duration::minutes(30),
            },
            vec![Entity::Customers],
        );

        let report = engine.execute(request).await.unwrap();

        assert_eq!(report.entities[0].deleted, 2);
        let remaining: Vec<_> = target
            .rows(Table::Target(Entity::Customers))
            .iter()
            .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(remaining, vec![0, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected_without_io() {
        let target = MemoryStore::with_target_schema();
        target.set_unreachable(true);
        let now = Utc::now();
        let engine = RollbackEngine::new(&target);
        let request = RollbackRequest::new(
            RollbackTrigger::Manual,
            RollbackStrategy::Partial {
                from: now,
                to: now - Duration::minutes(1),
            },
            vec![Entity::Customers],
        );

        let err = engine.execute(request).await.unwrap_err();
        assert!(matches!(err, RollbackError::InvalidStrategy(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_failure_fails_rollback() {
        let target = MemoryStore::with_target_schema();
        target.drop_table(Table::Target(Entity::Inventory));
        let engine = RollbackEngine::new(&target);
        let request = RollbackRequest::new(
            RollbackTrigger::Timeout,
            RollbackStrategy::Incremental,
            vec![Entity::Customers, Entity::Inventory],
        )
        .for_session(Uuid::new_v4(), Utc::now());

        let report = engine.execute(request).await.unwrap();
        assert_eq!(report.outcome, RollbackOutcome::Failed);
        assert!(report.checkpoint_id.is_none());
        assert!(report.error.is_some());
    }
}
