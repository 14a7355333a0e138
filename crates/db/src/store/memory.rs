use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    BackupStore, MaintenanceOp, OrphanSummary, PageRequest, Row, RowFilter, StoreError,
    StoreHealth, StoreReader, TableDdl, TargetStore, WriteMode, WriteSummary, compare_values,
    value_as_i64,
};
use crate::models::{
    Entity, Relationship, Table,
    entity::CREATED_AT,
};

/// In-process store implementing every store trait.
///
/// Clones share state. Used by tests and by dry runs over seeded data; the
/// `fail_*`/`set_*` hooks inject the faults the engine has to survive.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<Table, Vec<Row>>,
    failing_writes: HashMap<Table, u32>,
    failing_reads: HashMap<Table, u32>,
    write_delay: Option<Duration>,
    unreachable: bool,
    integrity_error: Option<String>,
    health: StoreHealth,
    batch_sizes: HashMap<Table, Vec<usize>>,
    maintenance_log: Vec<MaintenanceOp>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.write().health.max_connections = 10;
        store
    }

    /// Store with every legacy table created empty.
    pub fn with_legacy_schema() -> Self {
        let store = Self::new();
        for entity in Entity::ALL {
            store.create_table(Table::Legacy(entity));
        }
        store
    }

    /// Store with every target table created empty.
    pub fn with_target_schema() -> Self {
        let store = Self::new();
        for entity in Entity::ALL {
            store.create_table(Table::Target(entity));
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_table(&self, table: Table) {
        self.write().tables.entry(table).or_default();
    }

    pub fn drop_table(&self, table: Table) {
        self.write().tables.remove(&table);
    }

    /// Append rows verbatim, bypassing key checks.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Row>) {
        self.write().tables.entry(table).or_default().extend(rows);
    }

    /// Remove rows matching `predicate`, returning how many were removed.
    pub fn remove_where(&self, table: Table, predicate: impl Fn(&Row) -> bool) -> usize {
        let mut inner = self.write();
        let Some(rows) = inner.tables.get_mut(&table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|r| !predicate(r));
        before - rows.len()
    }

    /// Current rows of `table` in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.read().tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.read().tables.get(&table).map_or(0, Vec::len)
    }

    /// Make the next `times` writes to `table` fail.
    pub fn fail_next_writes(&self, table: Table, times: u32) {
        self.write().failing_writes.insert(table, times);
    }

    /// Make the next `times` page reads of `table` fail with a transient error.
    pub fn fail_next_reads(&self, table: Table, times: u32) {
        self.write().failing_reads.insert(table, times);
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.write().write_delay = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.write().unreachable = unreachable;
    }

    pub fn set_integrity_error(&self, error: Option<String>) {
        self.write().integrity_error = error;
    }

    pub fn set_health(&self, health: StoreHealth) {
        self.write().health = health;
    }

    /// Sizes of the batches successfully written to `table`, in order.
    pub fn batch_sizes(&self, table: Table) -> Vec<usize> {
        self.read()
            .batch_sizes
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn maintenance_log(&self) -> Vec<MaintenanceOp> {
        self.read().maintenance_log.clone()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.read().unreachable {
            Err(StoreError::Unavailable("memory store marked unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn take_failure(map: &mut HashMap<Table, u32>, table: Table) -> bool {
        match map.get_mut(&table) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn missing(table: Table) -> StoreError {
    StoreError::MissingTable(table.name().to_string())
}

fn same_key(table: Table, a: &Row, b: &Row) -> bool {
    if let (Some(x), Some(y)) = (value_as_i64(a.get("id")), value_as_i64(b.get("id")))
        && x == y
    {
        return true;
    }
    // NULL never collides on a unique index.
    table.natural_key().iter().all(|col| match (a.get(*col), b.get(*col)) {
        (Some(x), Some(y)) if !x.is_null() && !y.is_null() => x == y,
        _ => false,
    })
}

#[async_trait]
impl StoreReader for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn table_exists(&self, table: Table) -> Result<bool, StoreError> {
        self.check_reachable()?;
        Ok(self.read().tables.contains_key(&table))
    }

    async fn column_names(&self, table: Table) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        if !self.read().tables.contains_key(&table) {
            return Err(missing(table));
        }
        Ok(table.columns().iter().map(|c| c.to_string()).collect())
    }

    async fn count(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let inner = self.read();
        let rows = inner.tables.get(&table).ok_or_else(|| missing(table))?;
        Ok(rows.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn fetch_page(&self, table: Table, page: PageRequest) -> Result<Vec<Row>, StoreError> {
        self.check_reachable()?;
        let mut inner = self.write();
        if Self::take_failure(&mut inner.failing_reads, table) {
            return Err(StoreError::Timeout(Duration::from_millis(1)));
        }
        let rows = inner.tables.get(&table).ok_or_else(|| missing(table))?;
        let mut sorted: Vec<&Row> = rows.iter().collect();
        sorted.sort_by(|a, b| {
            page.order_by
                .iter()
                .map(|col| {
                    compare_values(
                        a.get(*col).unwrap_or(&Value::Null),
                        b.get(*col).unwrap_or(&Value::Null),
                    )
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(sorted
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn find_orphans(
        &self,
        rel: &Relationship,
        sample_limit: usize,
    ) -> Result<OrphanSummary, StoreError> {
        self.check_reachable()?;
        let inner = self.read();
        let child_table = Table::Target(rel.child);
        let parent_table = Table::Target(rel.parent);
        let children = inner.tables.get(&child_table).ok_or_else(|| missing(child_table))?;
        let parents: HashSet<i64> = inner
            .tables
            .get(&parent_table)
            .ok_or_else(|| missing(parent_table))?
            .iter()
            .filter_map(|r| value_as_i64(r.get("id")))
            .collect();

        let mut orphans: Vec<i64> = children
            .iter()
            .filter(|r| {
                let reference = r.get(rel.column).filter(|v| !v.is_null());
                reference.is_some() && !value_as_i64(reference).is_some_and(|id| parents.contains(&id))
            })
            .filter_map(|r| value_as_i64(r.get("id")))
            .collect();
        orphans.sort_unstable();
        let count = orphans.len() as u64;
        orphans.truncate(sample_limit);
        Ok(OrphanSummary {
            count,
            sample: orphans,
        })
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn insert_batch(
        &self,
        table: Table,
        records: &[Row],
        mode: WriteMode,
    ) -> Result<WriteSummary, StoreError> {
        self.check_reachable()?;
        let delay = self.read().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.write();
        if Self::take_failure(&mut inner.failing_writes, table) {
            return Err(StoreError::Unavailable(format!(
                "injected write failure on {table}"
            )));
        }
        let existing = inner.tables.get(&table).ok_or_else(|| missing(table))?;

        // Apply to a copy so a failing record leaves the table untouched.
        let mut staged = existing.clone();
        let mut summary = WriteSummary::default();
        for record in records {
            if let Some(unknown) = record.keys().find(|k| !table.columns().contains(&k.as_str())) {
                return Err(StoreError::InvalidRecord {
                    table: table.name().to_string(),
                    message: format!("unknown column {unknown}"),
                });
            }
            match staged.iter_mut().find(|row| same_key(table, row, record)) {
                Some(row) if mode == WriteMode::Upsert => {
                    for (column, value) in record {
                        if column != "id" && column != CREATED_AT {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                    summary.merged += 1;
                }
                Some(_) => {
                    return Err(StoreError::Constraint {
                        table: table.name().to_string(),
                        message: "UNIQUE constraint failed".to_string(),
                    });
                }
                None => {
                    staged.push(record.clone());
                    summary.inserted += 1;
                }
            }
        }

        inner.tables.insert(table, staged);
        inner
            .batch_sizes
            .entry(table)
            .or_default()
            .push(records.len());
        Ok(summary)
    }

    async fn delete_rows(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut inner = self.write();
        let rows = inner.tables.get_mut(&table).ok_or_else(|| missing(table))?;
        let before = rows.len();
        rows.retain(|r| !filter.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn execute(&self, op: MaintenanceOp) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut inner = self.write();
        if let MaintenanceOp::RecreateTable(ddl) = &op {
            inner.tables.insert(ddl.table, Vec::new());
        }
        inner.maintenance_log.push(op);
        Ok(())
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        self.check_reachable()?;
        Ok(self.read().health.clone())
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn verify_integrity(&self) -> Result<(), StoreError> {
        self.check_reachable()?;
        match &self.read().integrity_error {
            Some(e) => Err(StoreError::Integrity(e.clone())),
            None => Ok(()),
        }
    }

    /// Column list only; the rows are schemaless.
    async fn table_ddl(&self, table: Table) -> Result<TableDdl, StoreError> {
        self.check_reachable()?;
        if !self.read().tables.contains_key(&table) {
            return Err(missing(table));
        }
        Ok(TableDdl {
            table,
            create_sql: format!("CREATE TABLE {} ({})", table.name(), table.columns().join(", ")),
            index_sql: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::retry::Retryable;

    fn supplier(id: i64, code: &str) -> Row {
        json!({
            "id": id,
            "code": code,
            "company_name": format!("Supplier {id}"),
            "created_at": "2025-01-01T00:00:00.000000Z",
            "updated_at": "2025-01-01T00:00:00.000000Z",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    const SUPPLIERS: Table = Table::Target(Entity::Suppliers);

    #[tokio::test]
    async fn test_insert_conflict_leaves_table_untouched() {
        let store = MemoryStore::with_target_schema();
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A")], WriteMode::Insert)
            .await
            .unwrap();

        let err = store
            .insert_batch(
                SUPPLIERS,
                &[supplier(2, "B"), supplier(3, "A")],
                WriteMode::Insert,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
        assert_eq!(store.row_count(SUPPLIERS), 1);
    }

    #[tokio::test]
    async fn test_upsert_matches_natural_key_and_keeps_created_at() {
        let store = MemoryStore::with_target_schema();
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A")], WriteMode::Upsert)
            .await
            .unwrap();

        let mut update = supplier(1, "A");
        update.insert("company_name".into(), json!("Renamed"));
        update.insert("created_at".into(), json!("2030-01-01T00:00:00.000000Z"));
        let summary = store
            .insert_batch(SUPPLIERS, &[update], WriteMode::Upsert)
            .await
            .unwrap();
        assert_eq!(summary, WriteSummary { inserted: 0, merged: 1 });

        let rows = store.rows(SUPPLIERS);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["company_name"], json!("Renamed"));
        assert_eq!(rows[0]["created_at"], json!("2025-01-01T00:00:00.000000Z"));
        assert_eq!(store.batch_sizes(SUPPLIERS), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_fetch_page_orders_by_sort_key() {
        let store = MemoryStore::with_target_schema();
        store.seed(SUPPLIERS, [supplier(3, "C"), supplier(1, "A"), supplier(2, "B")]);

        let page = store
            .fetch_page(SUPPLIERS, PageRequest::for_table(SUPPLIERS, 1, 5))
            .await
            .unwrap();
        let ids: Vec<i64> = page.iter().filter_map(|r| value_as_i64(r.get("id"))).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::with_target_schema();
        store.fail_next_writes(SUPPLIERS, 1);

        let err = store
            .insert_batch(SUPPLIERS, &[supplier(1, "A")], WriteMode::Upsert)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A")], WriteMode::Upsert)
            .await
            .unwrap();
        assert_eq!(store.row_count(SUPPLIERS), 1);
    }

    #[tokio::test]
    async fn test_find_orphans() {
        let store = MemoryStore::with_target_schema();
        store.seed(SUPPLIERS, [supplier(1, "A")]);
        let product = |id: i64, supplier_id: Value| {
            json!({ "id": id, "sku": format!("P{id}"), "supplier_id": supplier_id })
                .as_object()
                .cloned()
                .unwrap()
        };
        store.seed(
            Table::Target(Entity::Products),
            [
                product(10, json!(1)),
                product(12, json!(99)),
                product(11, json!(98)),
                product(13, Value::Null),
            ],
        );

        let rel = Entity::Products.parent_relationships().next().unwrap();
        let orphans = store.find_orphans(rel, 1).await.unwrap();
        assert_eq!(orphans.count, 2);
        assert_eq!(orphans.sample, vec![11]);
    }

    #[tokio::test]
    async fn test_recreate_table_from_backup_definition() {
        let backup = MemoryStore::with_target_schema();
        let store = MemoryStore::new();
        store.seed(SUPPLIERS, [supplier(1, "A")]);

        let ddl = backup.table_ddl(SUPPLIERS).await.unwrap();
        assert!(ddl.create_sql.starts_with("CREATE TABLE suppliers ("));
        store
            .execute(MaintenanceOp::RecreateTable(ddl.clone()))
            .await
            .unwrap();
        assert_eq!(store.row_count(SUPPLIERS), 0);
        assert!(store.table_exists(SUPPLIERS).await.unwrap());
        assert_eq!(store.maintenance_log(), vec![MaintenanceOp::RecreateTable(ddl)]);

        backup.drop_table(SUPPLIERS);
        assert!(matches!(
            backup.table_ddl(SUPPLIERS).await,
            Err(StoreError::MissingTable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
    }
}
