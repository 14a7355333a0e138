use db::{
    BackupStore, RowFilter, TargetStore,
    models::{Entity, Table},
};
use tracing::info;

use super::{
    DETECTION_SAMPLE_SIZE, RollbackEngine, RollbackError, RollbackProgress, RollbackStrategy,
    children_first, parents_first,
};
use crate::services::validation::detect_problematic_tables;

/// Restore only the problematic tables from the backup. `tables` overrides
/// detection; otherwise candidates with orphaned rows or rows missing
/// required fields are picked.
pub(super) async fn run(
    engine: &RollbackEngine<'_>,
    backup: &dyn BackupStore,
    tables: Option<&[Entity]>,
    candidates: &[Entity],
    progress: &mut RollbackProgress,
) -> Result<(), RollbackError> {
    let strategy = RollbackStrategy::Selective {
        tables: tables.map(<[Entity]>::to_vec),
    };
    let target: &dyn TargetStore = engine.target;

    let selected = match tables {
        Some(tables) => tables.to_vec(),
        None => detect_problematic_tables(target, candidates, DETECTION_SAMPLE_SIZE)
            .await
            .map_err(RollbackError::step("detect problematic tables"))?,
    };
    if selected.is_empty() {
        info!("No problematic tables found, nothing to restore");
        engine.publish(&strategy, "no problematic tables", None);
        return Ok(());
    }
    info!(tables = ?selected, "Selective rollback of problematic tables");

    backup
        .verify_integrity()
        .await
        .map_err(RollbackError::BackupIntegrity)?;

    for entity in children_first(&selected) {
        let deleted = target
            .delete_rows(Table::Target(entity), RowFilter::All)
            .await
            .map_err(RollbackError::step(format!("clear {entity}")))?;
        progress.entry(entity).deleted = deleted;
        engine.publish(&strategy, format!("deleted {deleted} rows"), Some(entity));
    }

    for entity in parents_first(&selected) {
        let restored = engine.restore_from_backup(backup, entity).await?;
        progress.entry(entity).restored = restored;
        engine.publish(&strategy, format!("restored {restored} rows"), Some(entity));
    }

    for entity in parents_first(&selected) {
        engine.check_parity(backup, entity, progress).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use db::{MemoryStore, Row};
    use serde_json::json;

    use super::*;
    use crate::services::rollback::{RollbackOutcome, RollbackRequest, RollbackTrigger};

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn stores() -> (MemoryStore, MemoryStore) {
        let suppliers = [
            row(json!({"id": 1, "code": "S1", "company_name": "Acme"})),
            row(json!({"id": 2, "code": "S2", "company_name": "Globex"})),
        ];
        let customers = [row(json!({"id": 7, "code": "C7", "name": "Initech"}))];

        let backup = MemoryStore::with_target_schema();
        backup.seed(Table::Target(Entity::Suppliers), suppliers.clone());
        backup.seed(Table::Target(Entity::Customers), customers.clone());
        backup.seed(
            Table::Target(Entity::Products),
            [row(json!({"id": 10, "sku": "A", "name": "Bolt", "supplier_id": 1, "price_cents": 5}))],
        );

        let target = MemoryStore::with_target_schema();
        target.seed(Table::Target(Entity::Suppliers), suppliers);
        target.seed(
            Table::Target(Entity::Customers),
            customers
                .into_iter()
                .chain([row(json!({"id": 8, "code": "C8", "name": "Hooli"}))]),
        );
        target.seed(
            Table::Target(Entity::Products),
            [
                row(json!({"id": 10, "sku": "A", "name": "Bolt", "supplier_id": 1, "price_cents": 5})),
                row(json!({"id": 11, "sku": "B", "name": "Nut", "supplier_id": 99, "price_cents": 5})),
            ],
        );
        (target, backup)
    }

    #[tokio::test]
    async fn test_detected_tables_are_restored() {
        let (target, backup) = stores();
        let engine = RollbackEngine::new(&target).with_backup(&backup);
        let request = RollbackRequest::new(
            RollbackTrigger::ValidationFailure,
            RollbackStrategy::Selective { tables: None },
            vec![Entity::Suppliers, Entity::Customers, Entity::Products],
        );

        let report = engine.execute(request).await.unwrap();

        assert_eq!(report.outcome, RollbackOutcome::Completed, "{report:?}");
        assert_eq!(target.row_count(Table::Target(Entity::Products)), 1);
        // Healthy tables are left alone, including rows the backup lacks
        assert_eq!(target.row_count(Table::Target(Entity::Customers)), 2);

        let products = report
            .entities
            .iter()
            .find(|s| s.entity == Entity::Products)
            .unwrap();
        assert_eq!((products.deleted, products.restored), (2, 1));
    }

    #[tokio::test]
    async fn test_explicit_tables_override_detection() {
        let (target, backup) = stores();
        let engine = RollbackEngine::new(&target).with_backup(&backup);
        let request = RollbackRequest::new(
            RollbackTrigger::Manual,
            RollbackStrategy::Selective {
                tables: Some(vec![Entity::Customers]),
            },
            vec![Entity::Customers],
        );

        let report = engine.execute(request).await.unwrap();

        assert_eq!(target.row_count(Table::Target(Entity::Customers)), 1);
        // The dangling product was not part of the request
        assert_eq!(report.outcome, RollbackOutcome::Failed);
        assert!(
            report
                .findings
                .iter()
                .any(|f| f.code == "ORPHANED_PRODUCTS")
        );
    }

    #[tokio::test]
    async fn test_nothing_to_restore() {
        let (target, backup) = stores();
        let engine = RollbackEngine::new(&target).with_backup(&backup);
        let request = RollbackRequest::new(
            RollbackTrigger::ValidationFailure,
            RollbackStrategy::Selective { tables: None },
            vec![Entity::Customers],
        );

        let report = engine.execute(request).await.unwrap();

        assert_eq!(target.row_count(Table::Target(Entity::Customers)), 2);
        // The orphaned product is outside the rollback set but still reported
        assert_eq!(report.outcome, RollbackOutcome::Failed);
    }
}
