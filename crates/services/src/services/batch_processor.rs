//! Cursor → transform → bulk write loop for one entity.
//!
//! Per-record and per-batch failures are folded into the entity counters and
//! never escape this module; only entity-fatal conditions (unreadable source,
//! fail-fast, failure threshold, deadline, cancellation) are returned as
//! [`BatchError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use db::{
    Row, RowFilter, StoreError, StoreReader, TargetStore, with_retry, with_retry_if,
    models::{Entity, Table},
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::MigrationConfig,
    cursor::{BatchCursor, read_page},
    events::{EventBus, MigrationEvent},
    session::{EntityMigrationState, EntityStatus, RecordFailure, SessionSnapshot},
    transform::{ForeignKeyLookups, TransformError},
};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to read {table}: {source}")]
    Read {
        table: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("batch write to {table} failed after {attempts} attempts: {source}")]
    Write {
        table: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("{entity} failure rate {rate:.3} exceeds threshold {threshold:.3}")]
    FailureThreshold {
        entity: Entity,
        rate: f64,
        threshold: f64,
    },
    #[error("pipeline deadline exceeded")]
    DeadlineExceeded,
    #[error("migration cancelled")]
    Cancelled,
}

/// Outcome of one page. Folded into [`EntityMigrationState`] and then dropped.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub index: u64,
    pub read: u64,
    pub transformed: u64,
    pub failures: Vec<RecordFailure>,
    pub written: u64,
    /// Written records that landed on a row already holding their key.
    pub merged: u64,
    pub attempts: u32,
    pub write_error: Option<StoreError>,
}

impl BatchResult {
    /// Rows of this page that did not reach the target.
    pub fn failed(&self) -> u64 {
        self.read - self.written
    }
}

/// Runs one entity at a time against a source reader and a target writer.
pub struct BatchProcessor<'a, S: ?Sized, T: ?Sized> {
    source: &'a S,
    target: &'a T,
    config: &'a MigrationConfig,
    events: &'a EventBus,
    status: Option<&'a watch::Sender<SessionSnapshot>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<'a, S, T> BatchProcessor<'a, S, T>
where
    S: StoreReader + ?Sized,
    T: TargetStore + ?Sized,
{
    pub fn new(source: &'a S, target: &'a T, config: &'a MigrationConfig, events: &'a EventBus) -> Self {
        Self {
            source,
            target,
            config,
            events,
            status: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_status(mut self, status: &'a watch::Sender<SessionSnapshot>) -> Self {
        self.status = Some(status);
        self
    }

    /// Migrate `state.entity`, continuing from `state.cursor_offset`.
    ///
    /// On return the entity is `completed` or `failed` and
    /// `migrated + failed == total`.
    pub async fn migrate_entity<F>(
        &self,
        state: &mut EntityMigrationState,
        transform: F,
    ) -> Result<(), BatchError>
    where
        F: Fn(&Row, &ForeignKeyLookups, &DateTime<Utc>) -> Result<Row, TransformError>
            + Send
            + Sync,
    {
        state.status = EntityStatus::InProgress;
        state.started_at.get_or_insert_with(Utc::now);
        state.error = None;

        match self.run(state, &transform).await {
            Ok(()) => {
                state.status = EntityStatus::Completed;
                state.finished_at = Some(Utc::now());
                info!(
                    entity = %state.entity,
                    total = state.total,
                    migrated = state.migrated,
                    failed = state.failed,
                    batches = state.batches_processed,
                    "Entity migration completed"
                );
                self.finish(state);
                Ok(())
            }
            Err(e) => {
                state.mark_failed(e.to_string());
                warn!(
                    entity = %state.entity,
                    total = state.total,
                    migrated = state.migrated,
                    failed = state.failed,
                    error = %e,
                    "Entity migration aborted"
                );
                self.finish(state);
                Err(e)
            }
        }
    }

    fn finish(&self, state: &EntityMigrationState) {
        self.publish_status(state);
        self.events.publish(MigrationEvent::EntityFinished {
            entity: state.entity,
            status: state.status,
            total: state.total,
            migrated: state.migrated,
            failed: state.failed,
        });
    }

    fn publish_status(&self, state: &EntityMigrationState) {
        if let Some(status) = self.status {
            status.send_modify(|snapshot| {
                snapshot.current_entity = Some(state.entity);
                snapshot.update_entity(state);
            });
        }
    }

    fn check_boundary(&self) -> Result<(), BatchError> {
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(BatchError::DeadlineExceeded);
        }
        Ok(())
    }

    async fn run<F>(&self, state: &mut EntityMigrationState, transform: &F) -> Result<(), BatchError>
    where
        F: Fn(&Row, &ForeignKeyLookups, &DateTime<Utc>) -> Result<Row, TransformError>
            + Send
            + Sync,
    {
        let entity = state.entity;
        let table = Table::Legacy(entity);
        let retry = self.config.retry_config();
        let batch_timeout = self.config.batch_timeout();

        self.check_boundary()?;

        let total = with_retry(&retry, "count_source_rows", || {
            timed(batch_timeout, self.source.count(table, RowFilter::All))
        })
        .await
        .map_err(|source| BatchError::Read {
            table: table.name(),
            source,
        })?;
        // Never below what an earlier attempt already consumed.
        state.total = total.max(state.processed());
        self.events.publish(MigrationEvent::EntityStarted {
            entity,
            total: state.total,
        });
        self.publish_status(state);

        let parents: Vec<Entity> = entity.parent_relationships().map(|r| r.parent).collect();
        let lookups = if self.config.dry_run {
            ForeignKeyLookups::load(self.source, &parents, true, self.config.batch_size).await
        } else {
            ForeignKeyLookups::load(self.target, &parents, false, self.config.batch_size).await
        }
        .map_err(|source| BatchError::Read {
            table: table.name(),
            source,
        })?;

        let mut cursor = BatchCursor::new(
            entity,
            self.config.batch_size,
            state.total,
            state.cursor_offset,
        );
        let interval = self.config.progress_report_interval.max(1);
        let mut next_progress = (state.processed() / interval + 1) * interval;

        while let Some((offset, size)) = cursor.next_page() {
            self.check_boundary()?;

            let rows = with_retry(&retry, "read_source_page", || {
                timed(batch_timeout, read_page(self.source, entity, offset, size))
            })
            .await
            .map_err(|source| BatchError::Read {
                table: table.name(),
                source,
            })?;
            if rows.is_empty() {
                break;
            }
            cursor.advance(rows.len() as u64);

            let result = self.process_batch(state, &rows, &lookups, transform).await;
            self.fold(state, &result);

            self.events.publish(MigrationEvent::BatchCompleted {
                entity,
                batch: result.index,
                read: result.read,
                written: result.written,
                failed: result.failed(),
                attempts: result.attempts,
            });
            if state.processed() >= next_progress || cursor.is_exhausted() {
                self.events.publish(MigrationEvent::Progress {
                    entity,
                    processed: state.processed(),
                    total: state.total,
                    migrated: state.migrated,
                    failed: state.failed,
                });
                next_progress = (state.processed() / interval + 1) * interval;
            }
            self.publish_status(state);

            if let Some(source) = result.write_error
                && self.config.fail_fast
            {
                return Err(BatchError::Write {
                    table: Table::Target(entity).name(),
                    attempts: result.attempts,
                    source,
                });
            }

            let rate = state.failure_rate();
            if rate > self.config.failure_threshold {
                return Err(BatchError::FailureThreshold {
                    entity,
                    rate,
                    threshold: self.config.failure_threshold,
                });
            }
        }

        // The source shrank under us; rows counted at start but never read
        // did not reach the target.
        let vanished = state.remaining();
        if vanished > 0 {
            warn!(entity = %entity, vanished, "Source rows disappeared during migration");
            state.failed += vanished;
            state.record_failure(RecordFailure {
                source_id: None,
                reason: format!("{vanished} source rows disappeared during migration"),
            });
        }
        Ok(())
    }

    async fn process_batch<F>(
        &self,
        state: &EntityMigrationState,
        rows: &[Row],
        lookups: &ForeignKeyLookups,
        transform: &F,
    ) -> BatchResult
    where
        F: Fn(&Row, &ForeignKeyLookups, &DateTime<Utc>) -> Result<Row, TransformError>
            + Send
            + Sync,
    {
        let entity = state.entity;
        let written_at = Utc::now();
        let mut result = BatchResult {
            index: state.batches_processed + 1,
            read: rows.len() as u64,
            ..Default::default()
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match transform(row, lookups, &written_at) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(entity = %entity, source_id = ?super::transform::legacy_id(row), error = %e, "Record rejected");
                    result.failures.push(RecordFailure {
                        source_id: super::transform::legacy_id(row),
                        reason: e.to_string(),
                    });
                }
            }
        }
        result.transformed = records.len() as u64;

        if records.is_empty() || self.config.dry_run {
            result.written = result.transformed;
            return result;
        }

        let table = Table::Target(entity);
        let batch_timeout = self.config.batch_timeout();
        let mut attempts = 0u32;
        // Constraint violations are retried too; only malformed records are not.
        let write = with_retry_if(
            &self.config.retry_config(),
            "insert_batch",
            |e: &StoreError| !matches!(e, StoreError::InvalidRecord { .. }),
            || {
                attempts += 1;
                timed(
                    batch_timeout,
                    self.target.insert_batch(table, &records, self.config.write_mode),
                )
            },
        )
        .await;
        result.attempts = attempts;

        match write {
            Ok(summary) => {
                result.written = result.transformed;
                result.merged = summary.merged;
            }
            Err(e) => {
                warn!(
                    entity = %entity,
                    batch = result.index,
                    rows = records.len(),
                    attempts,
                    error = %e,
                    "Batch write failed, marking rows failed"
                );
                result.failures.push(RecordFailure {
                    source_id: None,
                    reason: format!("batch of {} rows failed: {e}", records.len()),
                });
                result.write_error = Some(e);
            }
        }
        result
    }

    fn fold(&self, state: &mut EntityMigrationState, result: &BatchResult) {
        state.migrated += result.written;
        state.merged += result.merged;
        state.failed += result.failed();
        state.cursor_offset += result.read;
        state.batches_processed += 1;
        state.retries += u64::from(result.attempts.saturating_sub(1));
        for failure in &result.failures {
            state.record_failure(failure.clone());
        }
        debug!(
            entity = %state.entity,
            batch = result.index,
            read = result.read,
            written = result.written,
            merged = result.merged,
            failed = result.failed(),
            "Batch processed"
        );
    }
}

/// Bound a store call by `limit`, surfacing expiry as a retryable store error.
async fn timed<Fut, R>(limit: Duration, fut: Fut) -> Result<R, StoreError>
where
    Fut: Future<Output = Result<R, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
