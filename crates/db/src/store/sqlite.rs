use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    Column, Row as _, SqlitePool, TypeInfo, ValueRef,
    error::ErrorKind,
    query::Query,
    sqlite::{Sqlite, SqliteArguments, SqliteRow},
};
use tracing::{debug, info};

use super::{
    BackupStore, MaintenanceOp, OrphanSummary, PageRequest, Row, RowFilter, StoreError,
    StoreHealth, StoreReader, TableDdl, TargetStore, WriteMode, WriteSummary,
};
use crate::{
    metrics::StoreMetrics,
    models::{
        Relationship, Table,
        entity::{CREATED_AT, TARGET_SORT_KEY},
    },
    storage_stats::file_sizes,
    validation::format_timestamp,
};

/// Host parameter ceiling of the bundled SQLite (3.32+).
const SQLITE_MAX_VARIABLES: usize = 32_766;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// [`StoreReader`], [`TargetStore`] and [`BackupStore`] over SQLite.
///
/// Reads go through `read_pool`; writes, deletes and DDL go through the
/// bounded `write_pool`. Read-only stores share one pool for both.
#[derive(Clone)]
pub struct SqliteStore {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
    db_path: PathBuf,
    shared_pool: bool,
    metrics: StoreMetrics,
}

impl SqliteStore {
    pub fn new(
        read_pool: SqlitePool,
        write_pool: SqlitePool,
        db_path: impl Into<PathBuf>,
        metrics: StoreMetrics,
    ) -> Self {
        Self {
            read_pool,
            write_pool,
            db_path: db_path.into(),
            shared_pool: false,
            metrics,
        }
    }

    /// A store where one pool serves both reads and writes.
    pub fn single_pool(pool: SqlitePool, db_path: impl Into<PathBuf>, metrics: StoreMetrics) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
            db_path: db_path.into(),
            shared_pool: true,
            metrics,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    fn observe<T>(&self, started: Instant, result: Result<T, sqlx::Error>) -> Result<T, sqlx::Error> {
        self.metrics.record_query(started.elapsed());
        if let Err(e) = &result {
            self.metrics.record_error(e);
        }
        result
    }
}

fn filter_clause(filter: RowFilter) -> (&'static str, Vec<String>) {
    match filter {
        RowFilter::All => ("", Vec::new()),
        RowFilter::CreatedSince(from) => (" WHERE created_at >= ?", vec![format_timestamp(&from)]),
        RowFilter::CreatedBetween { from, to } => (
            " WHERE created_at >= ? AND created_at < ?",
            vec![format_timestamp(&from), format_timestamp(&to)],
        ),
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decode a row by the runtime storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut record = Row::new();
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" | "NUMERIC" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(
                    String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(i)?).into_owned(),
                ),
                _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

/// Columns of `table` present in `record`, in schema order. Unknown keys are rejected.
fn record_columns(table: Table, record: &Row) -> Result<Vec<&'static str>, StoreError> {
    let columns: Vec<&'static str> = table
        .columns()
        .iter()
        .copied()
        .filter(|c| record.contains_key(*c))
        .collect();
    if columns.len() != record.len() {
        let unknown: Vec<&str> = record
            .keys()
            .map(String::as_str)
            .filter(|k| !table.columns().contains(k))
            .collect();
        return Err(StoreError::InvalidRecord {
            table: table.name().to_string(),
            message: format!("unknown columns: {}", unknown.join(", ")),
        });
    }
    Ok(columns)
}

/// Multi-row INSERT. Upserts use a targetless conflict clause so both the
/// primary key and the natural-key unique index resolve to an update.
fn build_insert_sql(table: Table, columns: &[&str], rows: usize, mode: WriteMode) -> String {
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.name(),
        columns.join(", "),
        vec![placeholders.as_str(); rows].join(", ")
    );
    if mode == WriteMode::Upsert {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !matches!(**c, "id" | CREATED_AT))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        if updates.is_empty() {
            sql.push_str(" ON CONFLICT DO NOTHING");
        } else {
            sql.push_str(" ON CONFLICT DO UPDATE SET ");
            sql.push_str(&updates.join(", "));
        }
    }
    sql
}

fn classify_write_error(table: Table, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => {
                return StoreError::Constraint {
                    table: table.name().to_string(),
                    message: db.message().to_string(),
                };
            }
            _ => {}
        }
    }
    StoreError::Database(error)
}

#[async_trait]
impl StoreReader for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.read_pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn table_exists(&self, table: Table) -> Result<bool, StoreError> {
        let started = Instant::now();
        let count: i64 = self.observe(
            started,
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table.name())
            .fetch_one(&self.read_pool)
            .await,
        )?;
        Ok(count > 0)
    }

    async fn column_names(&self, table: Table) -> Result<Vec<String>, StoreError> {
        let started = Instant::now();
        let names: Vec<String> = self.observe(
            started,
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(table.name())
                .fetch_all(&self.read_pool)
                .await,
        )?;
        Ok(names)
    }

    async fn count(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError> {
        let (clause, params) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM {}{}", table.name(), clause);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for param in params {
            query = query.bind(param);
        }
        let started = Instant::now();
        let count = self.observe(started, query.fetch_one(&self.read_pool).await)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_page(&self, table: Table, page: PageRequest) -> Result<Vec<Row>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            table.columns().join(", "),
            table.name(),
            page.order_by.join(", ")
        );
        let started = Instant::now();
        let rows = self.observe(
            started,
            sqlx::query(&sql)
                .bind(page.limit as i64)
                .bind(page.offset as i64)
                .fetch_all(&self.read_pool)
                .await,
        )?;
        let records = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        self.metrics.record_rows_read(records.len() as u64);
        Ok(records)
    }

    async fn find_orphans(
        &self,
        rel: &Relationship,
        sample_limit: usize,
    ) -> Result<OrphanSummary, StoreError> {
        let child = Table::Target(rel.child).name();
        let parent = Table::Target(rel.parent).name();
        let predicate = format!(
            "FROM {child} c WHERE c.{col} IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id = c.{col})",
            col = rel.column
        );

        let started = Instant::now();
        let count: i64 = self.observe(
            started,
            sqlx::query_scalar(&format!("SELECT COUNT(*) {predicate}"))
                .fetch_one(&self.read_pool)
                .await,
        )?;
        if count == 0 {
            return Ok(OrphanSummary::default());
        }

        let started = Instant::now();
        let sample: Vec<i64> = self.observe(
            started,
            sqlx::query_scalar(&format!(
                "SELECT c.id {predicate} ORDER BY {} LIMIT ?",
                TARGET_SORT_KEY
                    .iter()
                    .map(|c| format!("c.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .bind(sample_limit as i64)
            .fetch_all(&self.read_pool)
            .await,
        )?;

        Ok(OrphanSummary {
            count: count as u64,
            sample,
        })
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn insert_batch(
        &self,
        table: Table,
        records: &[Row],
        mode: WriteMode,
    ) -> Result<WriteSummary, StoreError> {
        let Some(first) = records.first() else {
            return Ok(WriteSummary::default());
        };
        let columns = record_columns(table, first)?;
        for record in &records[1..] {
            if record.len() != columns.len() || !columns.iter().all(|c| record.contains_key(*c)) {
                return Err(StoreError::InvalidRecord {
                    table: table.name().to_string(),
                    message: "records in one batch must share the same columns".to_string(),
                });
            }
        }
        let rows_per_statement = (SQLITE_MAX_VARIABLES / columns.len()).max(1);
        let batch_len = records.len() as u64;

        let started = Instant::now();
        let mut tx = self.write_pool.begin().await?;
        // rows_affected counts upsert updates as well, so compare row counts instead
        let count_sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let rows_before: i64 = match mode {
            WriteMode::Upsert => sqlx::query_scalar(&count_sql).fetch_one(&mut *tx).await?,
            WriteMode::Insert => 0,
        };
        let mut affected = 0u64;
        for chunk in records.chunks(rows_per_statement) {
            let sql = build_insert_sql(table, &columns, chunk.len(), mode);
            let mut query = sqlx::query(&sql);
            for record in chunk {
                for column in &columns {
                    query = bind_value(query, record.get(*column).unwrap_or(&Value::Null));
                }
            }
            let result = query.execute(&mut *tx).await;
            let result = self
                .observe(started, result)
                .map_err(|e| classify_write_error(table, e))?;
            affected += result.rows_affected();
        }
        let summary = match mode {
            WriteMode::Upsert => {
                let rows_after: i64 = sqlx::query_scalar(&count_sql).fetch_one(&mut *tx).await?;
                let inserted = ((rows_after - rows_before).max(0) as u64).min(batch_len);
                WriteSummary {
                    inserted,
                    merged: batch_len - inserted,
                }
            }
            WriteMode::Insert => WriteSummary {
                inserted: batch_len,
                merged: 0,
            },
        };
        tx.commit().await?;

        self.metrics.record_batch_written(batch_len);
        debug!(
            table = %table,
            rows = batch_len,
            affected,
            inserted = summary.inserted,
            merged = summary.merged,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(summary)
    }

    async fn delete_rows(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError> {
        let (clause, params) = filter_clause(filter);
        let sql = format!("DELETE FROM {}{}", table.name(), clause);
        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        let started = Instant::now();
        let result = self.observe(started, query.execute(&self.write_pool).await)?;
        self.metrics.record_rows_deleted(result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn execute(&self, op: MaintenanceOp) -> Result<(), StoreError> {
        let started = Instant::now();
        match op {
            MaintenanceOp::TerminateConnections => {
                // SQLite has no server sessions; flush the WAL so no reader holds old pages.
                let result = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&self.write_pool)
                    .await;
                self.observe(started, result)?;
                info!(db = %self.db_path.display(), "WAL truncated before restore");
            }
            MaintenanceOp::RecreateTable(ddl) => {
                let mut tx = self.write_pool.begin().await?;
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", ddl.table.name()))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&ddl.create_sql).execute(&mut *tx).await?;
                for sql in &ddl.index_sql {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                self.metrics.record_query(started.elapsed());
                debug!(table = %ddl.table, indexes = ddl.index_sql.len(), "Table recreated");
            }
            MaintenanceOp::RebuildIndexes(table) => {
                let result = sqlx::query(&format!("REINDEX {}", table.name()))
                    .execute(&self.write_pool)
                    .await;
                self.observe(started, result)?;
            }
            MaintenanceOp::Analyze => {
                let result = sqlx::query("ANALYZE").execute(&self.write_pool).await;
                self.observe(started, result)?;
            }
        }
        Ok(())
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        let read = self.metrics.get_pool_stats(&self.read_pool);
        let (storage_bytes, wal_bytes) = file_sizes(&self.db_path);
        let mut health = StoreHealth {
            active_connections: read.acquired,
            idle_connections: read.idle,
            max_connections: read.max,
            storage_bytes,
            wal_bytes,
            metrics: Some(self.metrics.snapshot()),
        };
        if !self.shared_pool {
            let write = self.metrics.get_pool_stats(&self.write_pool);
            health.active_connections += write.acquired;
            health.idle_connections += write.idle;
            health.max_connections += write.max;
        }
        Ok(health)
    }
}

#[async_trait]
impl BackupStore for SqliteStore {
    async fn verify_integrity(&self) -> Result<(), StoreError> {
        crate::check_database_integrity(&self.read_pool).await
    }

    async fn table_ddl(&self, table: Table) -> Result<TableDdl, StoreError> {
        let create_sql: Option<String> =
            sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table.name())
                .fetch_optional(&self.read_pool)
                .await?;
        let Some(create_sql) = create_sql else {
            return Err(StoreError::MissingTable(table.name().to_string()));
        };
        // Automatic indexes (UNIQUE/PRIMARY KEY constraints) have no SQL of their own
        let index_sql: Vec<String> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
        )
        .bind(table.name())
        .fetch_all(&self.read_pool)
        .await?;
        Ok(TableDdl {
            table,
            create_sql,
            index_sql,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entity;

    #[test]
    fn test_build_insert_sql_upsert_skips_identity_columns() {
        let sql = build_insert_sql(
            Table::Target(Entity::Suppliers),
            &["id", "code", "created_at", "updated_at"],
            2,
            WriteMode::Upsert,
        );
        assert_eq!(
            sql,
            "INSERT INTO suppliers (id, code, created_at, updated_at) VALUES (?, ?, ?, ?), (?, ?, ?, ?) \
             ON CONFLICT DO UPDATE SET code = excluded.code, updated_at = excluded.updated_at"
        );
    }

    #[test]
    fn test_build_insert_sql_plain_insert() {
        let sql = build_insert_sql(Table::Target(Entity::Inventory), &["id"], 1, WriteMode::Insert);
        assert_eq!(sql, "INSERT INTO inventory (id) VALUES (?)");
    }

    #[test]
    fn test_record_columns_rejects_unknown_keys() {
        let mut record = Row::new();
        record.insert("id".into(), Value::from(1));
        record.insert("password".into(), Value::from("x"));
        let err = record_columns(Table::Target(Entity::Suppliers), &record).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_filter_clause_binds_canonical_timestamps() {
        let from = chrono::DateTime::parse_from_rfc3339("2025-03-01T10:00:00+02:00")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let (clause, params) = filter_clause(RowFilter::CreatedSince(from));
        assert_eq!(clause, " WHERE created_at >= ?");
        assert_eq!(params, vec!["2025-03-01T08:00:00.000000Z".to_string()]);
    }

    fn supplier(id: i64, code: &str, name: &str, created_at: &str) -> Row {
        serde_json::json!({
            "id": id,
            "code": code,
            "company_name": name,
            "email": null,
            "phone": null,
            "source_created_at": "2020-01-01T00:00:00.000000Z",
            "created_at": created_at,
            "updated_at": created_at,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    const SUPPLIERS: Table = Table::Target(Entity::Suppliers);

    #[tokio::test]
    async fn test_upsert_round_trip_and_idempotence() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        let ts = "2025-01-01T00:00:00.000000Z";
        let batch = vec![supplier(1, "A", "Alpha", ts), supplier(2, "B", "Beta", ts)];

        let first = store.insert_batch(SUPPLIERS, &batch, WriteMode::Upsert).await.unwrap();
        assert_eq!(first, WriteSummary { inserted: 2, merged: 0 });
        let second = store.insert_batch(SUPPLIERS, &batch, WriteMode::Upsert).await.unwrap();
        assert_eq!(second, WriteSummary { inserted: 0, merged: 2 });
        assert_eq!(store.count(SUPPLIERS, RowFilter::All).await.unwrap(), 2);

        // Same natural key under a different id updates in place
        let renamed = supplier(5, "A", "Alpha Renamed", "2025-06-01T00:00:00.000000Z");
        let merged = store.insert_batch(SUPPLIERS, &[renamed], WriteMode::Upsert).await.unwrap();
        assert_eq!(merged.merged, 1);

        let rows = store
            .fetch_page(SUPPLIERS, PageRequest::for_table(SUPPLIERS, 0, 10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["company_name"], "Alpha Renamed");
        assert_eq!(rows[0]["created_at"], ts);
        assert_eq!(rows[0]["email"], Value::Null);
        assert_eq!(rows[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_upsert_counts_duplicate_keys_within_a_batch_as_merged() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        let ts = "2025-01-01T00:00:00.000000Z";
        let batch = vec![
            supplier(1, "C1", "First", ts),
            supplier(2, "C1", "Second", ts),
            supplier(3, "C2", "Third", ts),
        ];

        let summary = store.insert_batch(SUPPLIERS, &batch, WriteMode::Upsert).await.unwrap();

        assert_eq!(summary, WriteSummary { inserted: 2, merged: 1 });
        assert_eq!(summary.written(), 3);
        assert_eq!(store.count(SUPPLIERS, RowFilter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_conflict_rolls_back_whole_batch() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        let ts = "2025-01-01T00:00:00.000000Z";
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A", "Alpha", ts)], WriteMode::Insert)
            .await
            .unwrap();

        let err = store
            .insert_batch(
                SUPPLIERS,
                &[supplier(2, "B", "Beta", ts), supplier(3, "A", "Dup", ts)],
                WriteMode::Insert,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
        assert_eq!(store.count(SUPPLIERS, RowFilter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_rows_by_window() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        store
            .insert_batch(
                SUPPLIERS,
                &[
                    supplier(1, "A", "Alpha", "2025-01-01T00:00:00.000000Z"),
                    supplier(2, "B", "Beta", "2025-01-02T00:00:00.000000Z"),
                    supplier(3, "C", "Gamma", "2025-01-03T00:00:00.000000Z"),
                ],
                WriteMode::Insert,
            )
            .await
            .unwrap();

        let from = crate::validation::parse_timestamp("2025-01-02").unwrap();
        let to = crate::validation::parse_timestamp("2025-01-03").unwrap();
        let deleted = store
            .delete_rows(SUPPLIERS, RowFilter::CreatedBetween { from, to })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            store.count(SUPPLIERS, RowFilter::CreatedSince(from)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_recreate_table_uses_backup_definition() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let (backup_db, _backup_dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        let ts = "2025-01-01T00:00:00.000000Z";
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A", "Alpha", ts)], WriteMode::Insert)
            .await
            .unwrap();
        // The target drifted from the backup after the backup was taken
        sqlx::query("ALTER TABLE suppliers ADD COLUMN notes TEXT")
            .execute(&db.write_pool)
            .await
            .unwrap();
        sqlx::query("DROP INDEX idx_suppliers_code")
            .execute(&db.write_pool)
            .await
            .unwrap();

        let ddl = backup_db.store().table_ddl(SUPPLIERS).await.unwrap();
        assert_eq!(ddl.table, SUPPLIERS);
        assert!(!ddl.index_sql.is_empty());
        store.execute(MaintenanceOp::RecreateTable(ddl)).await.unwrap();

        assert_eq!(store.count(SUPPLIERS, RowFilter::All).await.unwrap(), 0);
        let columns = store.column_names(SUPPLIERS).await.unwrap();
        assert!(!columns.iter().any(|c| c == "notes"));
        // The unique code index came back with the backup definition
        store
            .insert_batch(SUPPLIERS, &[supplier(1, "A", "Alpha", ts)], WriteMode::Insert)
            .await
            .unwrap();
        let dup = store
            .insert_batch(SUPPLIERS, &[supplier(2, "A", "Other", ts)], WriteMode::Insert)
            .await;
        assert!(matches!(dup, Err(StoreError::Constraint { .. })));

        store.execute(MaintenanceOp::RebuildIndexes(SUPPLIERS)).await.unwrap();
        store.execute(MaintenanceOp::Analyze).await.unwrap();
        store.execute(MaintenanceOp::TerminateConnections).await.unwrap();
    }

    #[tokio::test]
    async fn test_table_ddl_of_missing_table() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        sqlx::query("DROP TABLE suppliers")
            .execute(&db.write_pool)
            .await
            .unwrap();

        let err = db.store().table_ddl(SUPPLIERS).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingTable(_)));
    }

    #[tokio::test]
    async fn test_health_reports_traffic_counters() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();
        let ts = "2025-01-01T00:00:00.000000Z";
        store
            .insert_batch(
                SUPPLIERS,
                &[supplier(1, "A", "Alpha", ts), supplier(2, "B", "Beta", ts)],
                WriteMode::Insert,
            )
            .await
            .unwrap();
        store
            .fetch_page(SUPPLIERS, PageRequest::for_table(SUPPLIERS, 0, 10))
            .await
            .unwrap();

        let metrics = store.health().await.unwrap().metrics.unwrap();
        assert_eq!(metrics.rows_written, 2);
        assert_eq!(metrics.batches_written, 1);
        assert_eq!(metrics.rows_read, 2);
        assert!(metrics.queries_total >= 2);
        // Counters live on the service, so every store handle sees them
        assert_eq!(db.store().health().await.unwrap().metrics.unwrap().rows_written, 2);
    }

    #[tokio::test]
    async fn test_schema_introspection_and_orphans() {
        let (db, _dir) = crate::test_utils::create_test_service().await;
        let store = db.store();

        assert!(store.table_exists(Table::Legacy(Entity::Suppliers)).await.unwrap());
        let columns = store.column_names(Table::Legacy(Entity::Products)).await.unwrap();
        assert_eq!(columns, Entity::Products.legacy_columns());

        sqlx::query(
            "INSERT INTO products (id, sku, name, supplier_id, price_cents, created_at, updated_at) \
             VALUES (7, 'X', 'Widget', 42, 100, 'a', 'a')",
        )
        .execute(&db.write_pool)
        .await
        .unwrap();
        let rel = Entity::Products.parent_relationships().next().unwrap();
        let orphans = store.find_orphans(rel, 10).await.unwrap();
        assert_eq!(orphans, OrphanSummary { count: 1, sample: vec![7] });

        let health = store.health().await.unwrap();
        assert!(health.max_connections >= 2);
        assert!(health.storage_bytes > 0);
        store.verify_integrity().await.unwrap();
    }
}
