//! Pre-migration gate: connectivity, schema presence and source data quality.

use std::collections::BTreeMap;

use db::{
    Row, StoreReader, WriteMode,
    models::{Entity, Table},
};
use serde_json::Value;

use super::{FindingKind, Severity, ValidationFinding};
use crate::services::{
    config::MigrationConfig,
    cursor::read_page,
    transform::{legacy_id, natural_key},
};

/// Legacy column whose absence breaks (critical) or degrades (warning) the target record.
struct RequiredField {
    column: &'static str,
    label: &'static str,
    severity: Severity,
}

const fn field(column: &'static str, label: &'static str, severity: Severity) -> RequiredField {
    RequiredField {
        column,
        label,
        severity,
    }
}

const SUPPLIER_FIELDS: &[RequiredField] = &[
    field("supplier_code", "CODE", Severity::Critical),
    field("company_name", "NAME", Severity::Critical),
    field("contact_email", "EMAIL", Severity::Warning),
];

const CUSTOMER_FIELDS: &[RequiredField] = &[
    field("customer_code", "CODE", Severity::Critical),
    field("name", "NAME", Severity::Critical),
    field("email", "EMAIL", Severity::Warning),
];

const PRODUCT_FIELDS: &[RequiredField] = &[
    field("sku", "SKU", Severity::Critical),
    field("name", "NAME", Severity::Critical),
    field("supplier_id", "SUPPLIER", Severity::Critical),
    field("unit_price", "PRICE", Severity::Critical),
];

// Missing warehouse and quantity fall back to defaults.
const INVENTORY_FIELDS: &[RequiredField] = &[
    field("product_id", "PRODUCT", Severity::Critical),
    field("warehouse", "WAREHOUSE", Severity::Warning),
    field("quantity", "QUANTITY", Severity::Warning),
];

const PRICE_LIST_FIELDS: &[RequiredField] = &[
    field("supplier_id", "SUPPLIER", Severity::Critical),
    field("product_id", "PRODUCT", Severity::Critical),
    field("price", "PRICE", Severity::Critical),
    field("currency", "CURRENCY", Severity::Warning),
];

const UPLOAD_FIELDS: &[RequiredField] = &[
    field("file_name", "FILE_NAME", Severity::Critical),
    field("status", "STATUS", Severity::Critical),
];

fn required_fields(entity: Entity) -> &'static [RequiredField] {
    match entity {
        Entity::Suppliers => SUPPLIER_FIELDS,
        Entity::Customers => CUSTOMER_FIELDS,
        Entity::Products => PRODUCT_FIELDS,
        Entity::Inventory => INVENTORY_FIELDS,
        Entity::PriceLists => PRICE_LIST_FIELDS,
        Entity::UploadHistory => UPLOAD_FIELDS,
    }
}

fn duplicate_code(entity: Entity) -> &'static str {
    match entity {
        Entity::Suppliers => "DUPLICATE_SUPPLIER_CODE",
        Entity::Customers => "DUPLICATE_CUSTOMER_CODE",
        Entity::Products => "DUPLICATE_PRODUCT_SKU",
        Entity::Inventory => "DUPLICATE_INVENTORY_LOCATION",
        Entity::PriceLists => "DUPLICATE_PRICE_LIST_ENTRY",
        Entity::UploadHistory => "DUPLICATE_UPLOAD_ID",
    }
}

pub(super) fn is_missing(row: &Row, column: &str) -> bool {
    match row.get(column) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreGateOptions {
    pub write_mode: WriteMode,
    pub scan_limit: Option<u64>,
    pub page_size: u64,
}

impl From<&MigrationConfig> for PreGateOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            write_mode: config.write_mode,
            scan_limit: config.quality_scan_limit,
            page_size: config.batch_size,
        }
    }
}

pub async fn run_pre_migration<S, T>(
    source: &S,
    target: &T,
    entities: &[Entity],
    options: &PreGateOptions,
) -> Vec<ValidationFinding>
where
    S: StoreReader + ?Sized,
    T: StoreReader + ?Sized,
{
    let mut findings = Vec::new();

    if let Err(e) = source.ping().await {
        findings.push(ValidationFinding::new(
            FindingKind::Connectivity,
            "SOURCE_UNREACHABLE",
            Severity::Critical,
            format!("source store is unreachable: {e}"),
        ));
    }
    if let Err(e) = target.ping().await {
        findings.push(ValidationFinding::new(
            FindingKind::Connectivity,
            "TARGET_UNREACHABLE",
            Severity::Critical,
            format!("target store is unreachable: {e}"),
        ));
    }
    if !findings.is_empty() {
        return findings;
    }

    for &entity in entities {
        let source_ok = check_source_schema(source, entity, &mut findings).await;
        check_target_schema(target, entity, &mut findings).await;
        if source_ok {
            scan_source_quality(source, entity, options, &mut findings).await;
        }
    }

    tracing::info!(
        entities = entities.len(),
        findings = findings.len(),
        critical = super::critical_count(&findings),
        "Pre-migration validation finished"
    );
    findings
}

fn read_failure(entity: Entity, error: impl std::fmt::Display) -> ValidationFinding {
    ValidationFinding::new(
        FindingKind::Connectivity,
        "SOURCE_READ_FAILED",
        Severity::Critical,
        format!("reading {} failed: {error}", entity.legacy_table()),
    )
    .for_entity(entity)
}

/// Returns whether the legacy table is complete enough to scan.
async fn check_source_schema<S>(
    source: &S,
    entity: Entity,
    findings: &mut Vec<ValidationFinding>,
) -> bool
where
    S: StoreReader + ?Sized,
{
    let table = Table::Legacy(entity);
    match source.table_exists(table).await {
        Ok(true) => {}
        Ok(false) => {
            findings.push(
                ValidationFinding::new(
                    FindingKind::SchemaMissing,
                    "MISSING_SOURCE_TABLE",
                    Severity::Critical,
                    format!("source table {table} does not exist"),
                )
                .for_entity(entity)
                .with_sample([table.name()]),
            );
            return false;
        }
        Err(e) => {
            findings.push(read_failure(entity, e));
            return false;
        }
    }

    let columns = match source.column_names(table).await {
        Ok(columns) => columns,
        Err(e) => {
            findings.push(read_failure(entity, e));
            return false;
        }
    };
    let missing: Vec<&str> = table
        .columns()
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if missing.is_empty() {
        return true;
    }
    findings.push(
        ValidationFinding::new(
            FindingKind::SchemaMissing,
            "MISSING_SOURCE_COLUMN",
            Severity::Critical,
            format!("source table {table} lacks columns: {}", missing.join(", ")),
        )
        .for_entity(entity)
        .with_count(missing.len() as u64)
        .with_sample(missing),
    );
    false
}

async fn check_target_schema<T>(target: &T, entity: Entity, findings: &mut Vec<ValidationFinding>)
where
    T: StoreReader + ?Sized,
{
    let table = Table::Target(entity);
    match target.table_exists(table).await {
        Ok(true) => {}
        Ok(false) => findings.push(
            ValidationFinding::new(
                FindingKind::SchemaMissing,
                "MISSING_TARGET_TABLE",
                Severity::Critical,
                format!("target table {table} does not exist"),
            )
            .for_entity(entity)
            .with_sample([table.name()]),
        ),
        Err(e) => findings.push(
            ValidationFinding::new(
                FindingKind::Connectivity,
                "TARGET_READ_FAILED",
                Severity::Critical,
                format!("inspecting {table} failed: {e}"),
            )
            .for_entity(entity),
        ),
    }
}

#[derive(Default)]
struct FieldGaps {
    count: u64,
    ids: Vec<i64>,
}

async fn scan_source_quality<S>(
    source: &S,
    entity: Entity,
    options: &PreGateOptions,
    findings: &mut Vec<ValidationFinding>,
) where
    S: StoreReader + ?Sized,
{
    let fields = required_fields(entity);
    let mut key_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut gaps: Vec<FieldGaps> = fields.iter().map(|_| FieldGaps::default()).collect();
    let limit = options.scan_limit.unwrap_or(u64::MAX);
    let mut scanned = 0u64;

    while scanned < limit {
        let size = options.page_size.max(1).min(limit - scanned);
        let rows = match read_page(source, entity, scanned, size).await {
            Ok(rows) => rows,
            Err(e) => {
                findings.push(read_failure(entity, e));
                return;
            }
        };
        if rows.is_empty() {
            break;
        }
        scanned += rows.len() as u64;

        for row in &rows {
            if let Some(key) = natural_key(entity, row) {
                *key_counts.entry(key).or_default() += 1;
            }
            for (field, gap) in fields.iter().zip(gaps.iter_mut()) {
                if is_missing(row, field.column) {
                    gap.count += 1;
                    if let Some(id) = legacy_id(row) {
                        gap.ids.push(id);
                    }
                }
            }
        }
    }

    let duplicates: Vec<(&String, &u64)> = key_counts.iter().filter(|(_, n)| **n > 1).collect();
    if !duplicates.is_empty() {
        let extra_rows: u64 = duplicates.iter().map(|(_, n)| **n - 1).sum();
        // An insert would violate the unique index; an upsert keeps the last row.
        let severity = match options.write_mode {
            WriteMode::Insert => Severity::Critical,
            WriteMode::Upsert => Severity::Warning,
        };
        findings.push(
            ValidationFinding::new(
                FindingKind::DuplicateKey,
                duplicate_code(entity),
                severity,
                format!(
                    "{} duplicate {} key(s) in {} ({extra_rows} extra rows)",
                    duplicates.len(),
                    entity,
                    entity.legacy_table()
                ),
            )
            .for_entity(entity)
            .with_count(extra_rows)
            .with_sample(duplicates.iter().map(|(key, _)| key.as_str())),
        );
    }

    for (field, gap) in fields.iter().zip(gaps) {
        if gap.count == 0 {
            continue;
        }
        let mut ids = gap.ids;
        ids.sort_unstable();
        findings.push(
            ValidationFinding::new(
                FindingKind::MissingRequiredField,
                format!("MISSING_{}_{}", entity.singular_label(), field.label),
                field.severity,
                format!(
                    "{} row(s) in {} have no {}",
                    gap.count,
                    entity.legacy_table(),
                    field.column
                ),
            )
            .for_entity(entity)
            .with_count(gap.count)
            .with_sample(ids.into_iter().take(super::MAX_FINDING_SAMPLE)),
        );
    }

    tracing::debug!(entity = %entity, scanned, "Source quality scan finished");
}
