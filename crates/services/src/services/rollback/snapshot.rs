use db::{
    BackupStore, MaintenanceOp, TargetStore,
    models::{Entity, Table},
};
use tracing::info;

use super::{
    RollbackEngine, RollbackError, RollbackProgress, RollbackStrategy, children_first,
    parents_first,
};

/// Restore `entities` wholesale from the backup.
pub(super) async fn run(
    engine: &RollbackEngine<'_>,
    backup: &dyn BackupStore,
    entities: &[Entity],
    progress: &mut RollbackProgress,
) -> Result<(), RollbackError> {
    let strategy = RollbackStrategy::Snapshot;
    let target: &dyn TargetStore = engine.target;

    backup
        .verify_integrity()
        .await
        .map_err(RollbackError::BackupIntegrity)?;
    engine.publish(&strategy, "backup verified", None);

    // Every definition is read up front so a gap in the backup fails before any drop
    let mut definitions = Vec::new();
    for entity in children_first(entities) {
        let ddl = backup
            .table_ddl(Table::Target(entity))
            .await
            .map_err(RollbackError::step(format!("read backup schema {entity}")))?;
        definitions.push((entity, ddl));
    }

    target
        .execute(MaintenanceOp::TerminateConnections)
        .await
        .map_err(RollbackError::step("terminate connections"))?;
    engine.publish(&strategy, "connections terminated", None);

    for (entity, ddl) in definitions {
        target
            .execute(MaintenanceOp::RecreateTable(ddl))
            .await
            .map_err(RollbackError::step(format!("recreate {entity}")))?;
        let stats = progress.entry(entity);
        stats.deleted = stats.before;
        engine.publish(&strategy, "table recreated", Some(entity));
    }

    for entity in parents_first(entities) {
        let restored = engine.restore_from_backup(backup, entity).await?;
        progress.entry(entity).restored = restored;
        info!(entity = %entity, restored, "Table restored from backup");
        engine.publish(&strategy, format!("restored {restored} rows"), Some(entity));
    }

    for entity in parents_first(entities) {
        target
            .execute(MaintenanceOp::RebuildIndexes(Table::Target(entity)))
            .await
            .map_err(RollbackError::step(format!("rebuild indexes {entity}")))?;
    }
    target
        .execute(MaintenanceOp::Analyze)
        .await
        .map_err(RollbackError::step("analyze"))?;
    engine.publish(&strategy, "indexes rebuilt", None);

    for entity in parents_first(entities) {
        engine.check_parity(backup, entity, progress).await?;
    }
    Ok(())
}
