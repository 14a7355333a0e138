//! Post-migration gate: count reconciliation, sampled field checks and
//! relationship integrity.
//!
//! The relationship and field checks are shared with the rollback engine,
//! which uses them to pick the tables a selective rollback restores and to
//! verify the target afterwards.

use db::{
    PageRequest, StoreError, StoreReader,
    models::{Entity, RELATIONSHIPS, Table},
};

use super::{FindingKind, MAX_FINDING_SAMPLE, Severity, ValidationFinding, pre_gate::is_missing};
use crate::services::{session::EntityMigrationState, transform::legacy_id};

pub async fn run_post_migration<T>(
    target: &T,
    states: &[EntityMigrationState],
    dry_run: bool,
    sample_size: u64,
) -> Vec<ValidationFinding>
where
    T: StoreReader + ?Sized,
{
    let mut findings = Vec::new();

    for state in states {
        let entity = state.entity;
        if state.migrated != state.total {
            findings.push(
                ValidationFinding::new(
                    FindingKind::RecordCountMismatch,
                    "RECORD_COUNT_MISMATCH",
                    Severity::Critical,
                    format!(
                        "{} of {} {entity} records migrated ({} failed)",
                        state.migrated, state.total, state.failed
                    ),
                )
                .for_entity(entity)
                .with_count(state.total.abs_diff(state.migrated)),
            );
        }

        // Nothing was written in a dry run, so the target has nothing to reconcile.
        if dry_run {
            continue;
        }

        // Upserted duplicates share a row, so they never add one.
        let expected_rows = state.migrated.saturating_sub(state.merged);
        match target.count(Table::Target(entity), db::RowFilter::All).await {
            Ok(rows) if rows < expected_rows => findings.push(
                ValidationFinding::new(
                    FindingKind::RecordCountMismatch,
                    "RECORD_COUNT_MISMATCH",
                    Severity::Critical,
                    format!(
                        "target {} holds {rows} rows but {} were migrated ({} merged)",
                        entity.target_table(),
                        state.migrated,
                        state.merged
                    ),
                )
                .for_entity(entity)
                .with_count(expected_rows - rows),
            ),
            Ok(_) => {}
            Err(e) => {
                findings.push(read_failure(entity, e));
                continue;
            }
        }

        match check_required_fields(target, entity, sample_size).await {
            Ok(Some(finding)) => findings.push(finding),
            Ok(None) => {}
            Err(e) => findings.push(read_failure(entity, e)),
        }
    }

    if !dry_run {
        let children: Vec<Entity> = states.iter().map(|s| s.entity).collect();
        match check_relationships(target, &children).await {
            Ok(orphans) => findings.extend(orphans),
            Err(e) => findings.push(
                ValidationFinding::new(
                    FindingKind::Connectivity,
                    "TARGET_READ_FAILED",
                    Severity::Critical,
                    format!("relationship check failed: {e}"),
                ),
            ),
        }
    }

    tracing::info!(
        entities = states.len(),
        findings = findings.len(),
        critical = super::critical_count(&findings),
        "Post-migration validation finished"
    );
    findings
}

fn read_failure(entity: Entity, error: StoreError) -> ValidationFinding {
    ValidationFinding::new(
        FindingKind::Connectivity,
        "TARGET_READ_FAILED",
        Severity::Critical,
        format!("reading {} failed: {error}", entity.target_table()),
    )
    .for_entity(entity)
}

/// Sample up to `sample_size` target rows (lowest ids first) and report rows
/// missing a non-nullable business field.
pub async fn check_required_fields<T>(
    target: &T,
    entity: Entity,
    sample_size: u64,
) -> Result<Option<ValidationFinding>, StoreError>
where
    T: StoreReader + ?Sized,
{
    let table = Table::Target(entity);
    let rows = target
        .fetch_page(table, PageRequest::for_table(table, 0, sample_size))
        .await?;

    let mut bad_ids = Vec::new();
    let mut bad_rows = 0u64;
    let mut fields: Vec<&str> = Vec::new();
    for row in &rows {
        let missing: Vec<&str> = entity
            .required_target_fields()
            .iter()
            .copied()
            .filter(|f| is_missing(row, f))
            .collect();
        if missing.is_empty() {
            continue;
        }
        bad_rows += 1;
        if let Some(id) = legacy_id(row) {
            bad_ids.push(id);
        }
        for f in missing {
            if !fields.contains(&f) {
                fields.push(f);
            }
        }
    }

    if bad_rows == 0 {
        return Ok(None);
    }
    bad_ids.sort_unstable();
    fields.sort_unstable();
    Ok(Some(
        ValidationFinding::new(
            FindingKind::InvalidData,
            format!("INVALID_{}_DATA", entity.label()),
            Severity::Warning,
            format!(
                "{bad_rows} of {} sampled {entity} rows lack: {}",
                rows.len(),
                fields.join(", ")
            ),
        )
        .for_entity(entity)
        .with_count(bad_rows)
        .with_sample(bad_ids.into_iter().take(MAX_FINDING_SAMPLE)),
    ))
}

/// Orphaned references for every relationship whose child is in `children`.
///
/// Orphans of enforced relationships are critical, the rest are warnings;
/// `count` is the number of orphaned child rows.
pub async fn check_relationships<T>(
    target: &T,
    children: &[Entity],
) -> Result<Vec<ValidationFinding>, StoreError>
where
    T: StoreReader + ?Sized,
{
    let mut findings = Vec::new();
    for rel in RELATIONSHIPS.iter().filter(|r| children.contains(&r.child)) {
        let orphans = target.find_orphans(rel, MAX_FINDING_SAMPLE).await?;
        if orphans.count == 0 {
            continue;
        }
        let severity = if rel.enforced {
            Severity::Critical
        } else {
            Severity::Warning
        };
        findings.push(
            ValidationFinding::new(
                FindingKind::OrphanedReference,
                format!("ORPHANED_{}", rel.child.label()),
                severity,
                format!(
                    "{} {} rows reference a missing {} through {}",
                    orphans.count, rel.child, rel.parent, rel.column
                ),
            )
            .for_entity(rel.child)
            .with_count(orphans.count)
            .with_sample(orphans.sample),
        );
    }
    Ok(findings)
}

/// Entities of `candidates` whose target table has orphaned rows or sampled
/// rows with missing required fields, in the order given.
pub async fn detect_problematic_tables<T>(
    target: &T,
    candidates: &[Entity],
    sample_size: u64,
) -> Result<Vec<Entity>, StoreError>
where
    T: StoreReader + ?Sized,
{
    let mut problematic = Vec::new();
    for &entity in candidates {
        let orphaned = !check_relationships(target, &[entity]).await?.is_empty();
        let invalid = check_required_fields(target, entity, sample_size)
            .await?
            .is_some();
        if orphaned || invalid {
            problematic.push(entity);
        }
    }
    Ok(problematic)
}
