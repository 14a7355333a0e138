//! Store abstraction consumed by the migration engine.
//!
//! Three capabilities are exposed as traits so the engine never depends on a
//! concrete database client:
//!
//! - [`StoreReader`]: paginated, ordered reads plus schema introspection
//! - [`TargetStore`]: bulk writes, filtered deletes and maintenance operations
//! - [`BackupStore`]: a point-in-time copy used only by rollback
//!
//! [`SqliteStore`] implements all three on sqlx; [`MemoryStore`] is an
//! in-process implementation with fault injection for tests and dry runs.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::{cmp::Ordering, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ts_rs::TS;

use crate::{
    metrics::StoreMetricsSnapshot,
    models::{Relationship, Table},
    retry::{Retryable, is_retryable_error},
    validation::ValidationError,
};

/// One record, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("invalid record for {table}: {message}")]
    InvalidRecord { table: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => {
                is_retryable_error(e) || matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            }
            StoreError::Timeout(_) | StoreError::Unavailable(_) | StoreError::Io(_) => true,
            _ => false,
        }
    }
}

/// One page of an ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub order_by: &'static [&'static str],
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    /// Page over `table` using its stable sort key.
    pub fn for_table(table: Table, offset: u64, limit: u64) -> Self {
        Self {
            order_by: table.sort_key(),
            offset,
            limit,
        }
    }
}

/// Row selection by write timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter {
    All,
    /// `created_at >= from`
    CreatedSince(DateTime<Utc>),
    /// `from <= created_at < to`
    CreatedBetween {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl RowFilter {
    /// In-process evaluation; rows without a parseable `created_at` only match `All`.
    pub fn matches(&self, row: &Row) -> bool {
        if matches!(self, RowFilter::All) {
            return true;
        }
        let Some(created_at) = row
            .get(crate::models::entity::CREATED_AT)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
        else {
            return false;
        };
        match *self {
            RowFilter::All => true,
            RowFilter::CreatedSince(from) => created_at >= from,
            RowFilter::CreatedBetween { from, to } => created_at >= from && created_at < to,
        }
    }
}

/// How a batch is written to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum WriteMode {
    /// Plain insert; any key conflict fails the batch.
    Insert,
    /// Insert or update on conflict with the primary or natural key.
    #[default]
    Upsert,
}

impl std::str::FromStr for WriteMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(WriteMode::Insert),
            "upsert" => Ok(WriteMode::Upsert),
            _ => Err(ValidationError::InvalidWriteMode(s.to_string())),
        }
    }
}

/// DDL and maintenance statements the rollback engine may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOp {
    /// Disconnect other sessions from the target.
    TerminateConnections,
    /// Drop the table and recreate it empty from the given definition.
    RecreateTable(TableDdl),
    RebuildIndexes(Table),
    /// Refresh planner statistics.
    Analyze,
}

/// Statements that create a table and its indexes, as recorded in a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDdl {
    pub table: Table,
    pub create_sql: String,
    pub index_sql: Vec<String>,
}

/// What one committed batch did to the target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Records that created a new row.
    pub inserted: u64,
    /// Upserted records that landed on a row already holding their key,
    /// including earlier records of the same batch.
    pub merged: u64,
}

impl WriteSummary {
    pub fn written(&self) -> u64 {
        self.inserted + self.merged
    }
}

/// Connection and storage figures polled by the progress monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StoreHealth {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
    pub storage_bytes: u64,
    pub wal_bytes: u64,
    /// Query and row counters since the store was opened. Stores that keep
    /// none report `None`.
    #[serde(default)]
    pub metrics: Option<StoreMetricsSnapshot>,
}

impl StoreHealth {
    /// Fraction of the pool in use, 0.0 when the pool size is unknown.
    pub fn pool_usage(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            self.active_connections as f64 / self.max_connections as f64
        }
    }
}

/// Children whose foreign key points at a missing parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSummary {
    pub count: u64,
    /// Lowest offending child ids, ascending.
    pub sample: Vec<i64>,
}

#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Cheap round trip proving the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn table_exists(&self, table: Table) -> Result<bool, StoreError>;

    async fn column_names(&self, table: Table) -> Result<Vec<String>, StoreError>;

    async fn count(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError>;

    /// Rows ordered by `page.order_by`, skipping `page.offset`, at most `page.limit`.
    async fn fetch_page(&self, table: Table, page: PageRequest) -> Result<Vec<Row>, StoreError>;

    /// Target-schema rows of `rel.child` whose `rel.column` references a
    /// missing `rel.parent`. NULL references are not orphans.
    async fn find_orphans(
        &self,
        rel: &Relationship,
        sample_limit: usize,
    ) -> Result<OrphanSummary, StoreError>;
}

#[async_trait]
pub trait TargetStore: StoreReader {
    /// Write all records in one transaction; either every record lands or none.
    async fn insert_batch(
        &self,
        table: Table,
        records: &[Row],
        mode: WriteMode,
    ) -> Result<WriteSummary, StoreError>;

    async fn delete_rows(&self, table: Table, filter: RowFilter) -> Result<u64, StoreError>;

    async fn execute(&self, op: MaintenanceOp) -> Result<(), StoreError>;

    async fn health(&self) -> Result<StoreHealth, StoreError>;
}

#[async_trait]
pub trait BackupStore: StoreReader {
    /// Confirm the backup is structurally sound before restoring from it.
    async fn verify_integrity(&self) -> Result<(), StoreError>;

    /// Definition of `table` as it stood when the backup was taken.
    async fn table_ddl(&self, table: Table) -> Result<TableDdl, StoreError>;
}

/// Total order over JSON scalars used for in-process sorting:
/// null < bool < number < string < anything else.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&y.as_f64().unwrap_or(0.0)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Read an integer column, accepting numeric strings.
pub fn value_as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(created_at: &str) -> Row {
        json!({ "id": 1, "created_at": created_at })
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_row_filter_windows() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let inside = row("2025-01-01T12:00:00.000000Z");
        let at_end = row("2025-01-02T00:00:00.000000Z");
        let before = row("2024-12-31T23:59:59.999999Z");

        let since = RowFilter::CreatedSince(from);
        assert!(since.matches(&inside));
        assert!(since.matches(&at_end));
        assert!(!since.matches(&before));

        let window = RowFilter::CreatedBetween { from, to };
        assert!(window.matches(&inside));
        assert!(!window.matches(&at_end));
        assert!(!window.matches(&before));

        assert!(RowFilter::All.matches(&before));
    }

    #[test]
    fn test_row_filter_requires_timestamp() {
        let mut r = row("not a date");
        assert!(!RowFilter::CreatedSince(Utc::now()).matches(&r));
        r.remove("created_at");
        assert!(RowFilter::All.matches(&r));
    }

    #[test]
    fn test_compare_values_orders_mixed_types() {
        let mut values = vec![json!("b"), json!(10), Value::Null, json!(2), json!("a"), json!(2.5)];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![Value::Null, json!(2), json!(2.5), json!(10), json!("a"), json!("b")]
        );
    }

    #[test]
    fn test_value_as_i64() {
        assert_eq!(value_as_i64(Some(&json!(7))), Some(7));
        assert_eq!(value_as_i64(Some(&json!(7.0))), Some(7));
        assert_eq!(value_as_i64(Some(&json!(" 42 "))), Some(42));
        assert_eq!(value_as_i64(Some(&json!(7.5))), None);
        assert_eq!(value_as_i64(Some(&Value::Null)), None);
        assert_eq!(value_as_i64(None), None);
    }

    #[test]
    fn test_write_mode_parse() {
        assert_eq!("UPSERT".parse::<WriteMode>().unwrap(), WriteMode::Upsert);
        assert_eq!("insert".parse::<WriteMode>().unwrap(), WriteMode::Insert);
        assert!("merge".parse::<WriteMode>().is_err());
    }

    #[test]
    fn test_pool_usage() {
        let health = StoreHealth {
            active_connections: 9,
            max_connections: 10,
            ..Default::default()
        };
        assert!((health.pool_usage() - 0.9).abs() < f64::EPSILON);
        assert_eq!(StoreHealth::default().pool_usage(), 0.0);
    }
}
