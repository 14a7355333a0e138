//! Full migrations against a real SQLite database holding both the legacy
//! and the target schema.

use std::sync::Arc;

use db::{DBService, models::Entity, test_utils::create_test_service};
use services::services::{
    config::{EntityConfig, MigrationConfig},
    orchestrator::MigrationOrchestrator,
    report::OverallStatus,
    rollback::{RollbackEngine, RollbackOutcome, RollbackRequest, RollbackStrategy, RollbackTrigger},
    session::MigrationSession,
};

async fn seed_legacy(db: &DBService) {
    for id in 1..=3i64 {
        sqlx::query(
            "INSERT INTO legacy_suppliers (id, supplier_code, company_name, contact_email, created_at)
             VALUES (?, ?, ?, ?, '2019-03-01T08:00:00Z')",
        )
        .bind(id)
        .bind(format!(" s{id} "))
        .bind(format!("Supplier {id}"))
        .bind(format!("Orders@Supplier{id}.example"))
        .execute(&db.write_pool)
        .await
        .unwrap();
    }
    for id in 100..130i64 {
        sqlx::query(
            "INSERT INTO legacy_products (id, sku, name, supplier_id, unit, unit_price, created_at)
             VALUES (?, ?, ?, ?, 'PCS', ?, '2019-05-01T08:00:00Z')",
        )
        .bind(id)
        .bind(format!("sku-{id}"))
        .bind(format!("Product {id}"))
        .bind(1 + id % 3)
        .bind(9.99)
        .execute(&db.write_pool)
        .await
        .unwrap();
    }
}

fn config() -> MigrationConfig {
    MigrationConfig {
        batch_size: 7,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        entities: [Entity::Products, Entity::Suppliers]
            .into_iter()
            .map(EntityConfig::with_default_dependencies)
            .collect(),
        ..Default::default()
    }
}

async fn count(db: &DBService, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(&db.read_pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_migrates_catalog_into_target_schema() {
    let (db, _temp) = create_test_service().await;
    seed_legacy(&db).await;
    let store = Arc::new(db.store());
    let orchestrator = MigrationOrchestrator::new(store.clone(), store);
    let mut session = MigrationSession::new(config());

    let report = orchestrator.execute(&mut session).await.unwrap();

    assert_eq!(report.status, OverallStatus::Success, "{:?}", report.findings);
    assert_eq!(report.stats.migrated_records, 33);
    assert_eq!(count(&db, "suppliers").await, 3);
    assert_eq!(count(&db, "products").await, 30);
    let traffic = db.metrics.snapshot();
    assert_eq!(traffic.rows_written, 33);
    assert!(traffic.rows_read >= 33);

    let (code, email): (String, String) =
        sqlx::query_as("SELECT code, email FROM suppliers WHERE id = 1")
            .fetch_one(&db.read_pool)
            .await
            .unwrap();
    assert_eq!(code, "S1");
    assert_eq!(email, "orders@supplier1.example");

    let (price_cents, unit): (i64, String) =
        sqlx::query_as("SELECT price_cents, unit FROM products WHERE id = 100")
            .fetch_one(&db.read_pool)
            .await
            .unwrap();
    assert_eq!(price_cents, 999);
    assert_eq!(unit, "pcs");
}

#[tokio::test]
async fn test_second_run_upserts_in_place() {
    let (db, _temp) = create_test_service().await;
    seed_legacy(&db).await;
    let store = Arc::new(db.store());

    for run in 0..2u64 {
        let orchestrator = MigrationOrchestrator::new(store.clone(), store.clone());
        let mut session = MigrationSession::new(config());
        let report = orchestrator.execute(&mut session).await.unwrap();
        assert!(report.is_success(), "{:?}", report.findings);
        // The second run lands every record on its existing row
        let products = session.entity(Entity::Products).unwrap();
        assert_eq!(products.merged, run * 30);
    }

    assert_eq!(count(&db, "suppliers").await, 3);
    assert_eq!(count(&db, "products").await, 30);
}

#[tokio::test]
async fn test_incremental_rollback_empties_session_rows() {
    let (db, _temp) = create_test_service().await;
    seed_legacy(&db).await;
    let store = Arc::new(db.store());
    let orchestrator = MigrationOrchestrator::new(store.clone(), store.clone());
    let mut session = MigrationSession::new(config());
    orchestrator.execute(&mut session).await.unwrap();

    let engine = RollbackEngine::new(&*store);
    let request = RollbackRequest::new(
        RollbackTrigger::Manual,
        RollbackStrategy::Incremental,
        session.config.selected_entities(),
    )
    .for_session(session.id, session.started_at);
    let rollback = engine.execute(request).await.unwrap();

    assert_eq!(rollback.outcome, RollbackOutcome::Completed, "{rollback:?}");
    assert_eq!(count(&db, "suppliers").await, 0);
    assert_eq!(count(&db, "products").await, 0);
    // Legacy data is never touched
    assert_eq!(count(&db, "legacy_products").await, 30);
}
