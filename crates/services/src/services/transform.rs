//! Legacy row → target record mapping, one pure function per entity.
//!
//! Nothing here touches a store. Parent ids needed for reference checks are
//! passed in through [`ForeignKeyLookups`], loaded once per entity by the
//! batch processor.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use db::{
    PageRequest, Row, StoreError, StoreReader,
    models::{Entity, Table},
    validation::format_timestamp,
};
use serde_json::{Value, json};
use thiserror::Error;

const DEFAULT_WAREHOUSE: &str = "MAIN";
const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("{column} references missing {parent} id {id}")]
    UnknownReference {
        column: &'static str,
        parent: Entity,
        id: i64,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> TransformError {
    TransformError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Known parent ids per entity.
///
/// A parent that was never loaded is not checked; a loaded parent rejects
/// every id it does not contain.
#[derive(Debug, Clone, Default)]
pub struct ForeignKeyLookups {
    ids: HashMap<Entity, HashSet<i64>>,
}

impl ForeignKeyLookups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity, ids: impl IntoIterator<Item = i64>) {
        self.ids.entry(entity).or_default().extend(ids);
    }

    pub fn is_loaded(&self, entity: Entity) -> bool {
        self.ids.contains_key(&entity)
    }

    pub fn len(&self, entity: Entity) -> usize {
        self.ids.get(&entity).map_or(0, HashSet::len)
    }

    fn check(&self, column: &'static str, parent: Entity, id: i64) -> Result<(), TransformError> {
        match self.ids.get(&parent) {
            Some(ids) if !ids.contains(&id) => {
                Err(TransformError::UnknownReference { column, parent, id })
            }
            _ => Ok(()),
        }
    }

    /// Load the ids of `parents` from the target schema, or from the legacy
    /// schema when `from_source` is set (dry runs write nothing to look up).
    pub async fn load<R>(
        reader: &R,
        parents: &[Entity],
        from_source: bool,
        page_size: u64,
    ) -> Result<Self, StoreError>
    where
        R: StoreReader + ?Sized,
    {
        let mut lookups = Self::new();
        for &parent in parents {
            let table = if from_source {
                Table::Legacy(parent)
            } else {
                Table::Target(parent)
            };
            let mut ids = HashSet::new();
            let mut offset = 0;
            loop {
                let page = reader
                    .fetch_page(table, PageRequest::for_table(table, offset, page_size.max(1)))
                    .await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len() as u64;
                ids.extend(page.iter().filter_map(|r| db::store::value_as_i64(r.get("id"))));
            }
            tracing::debug!(parent = %parent, table = %table, ids = ids.len(), "Loaded foreign key lookup");
            lookups.ids.insert(parent, ids);
        }
        Ok(lookups)
    }
}

/// Map one legacy row of `entity` to a target record stamped with `written_at`.
pub fn transform_record(
    entity: Entity,
    row: &Row,
    lookups: &ForeignKeyLookups,
    written_at: &DateTime<Utc>,
) -> Result<Row, TransformError> {
    let mut record = match entity {
        Entity::Suppliers => supplier(row)?,
        Entity::Customers => customer(row)?,
        Entity::Products => product(row, lookups)?,
        Entity::Inventory => inventory(row, lookups)?,
        Entity::PriceLists => price_list(row, lookups)?,
        Entity::UploadHistory => upload(row)?,
    };
    let id = legacy_id(row).ok_or(TransformError::MissingField("id"))?;
    let stamp = Value::String(format_timestamp(written_at));
    record.insert("id".into(), json!(id));
    record.insert("source_created_at".into(), opt(text(row, "created_at")));
    record.insert("created_at".into(), stamp.clone());
    record.insert("updated_at".into(), stamp);
    Ok(record)
}

/// The record's business key after the same normalisation the transform
/// applies, `None` when a component is missing.
pub fn natural_key(entity: Entity, row: &Row) -> Option<String> {
    let parts = match entity {
        Entity::Suppliers => vec![code(row, "supplier_code")?],
        Entity::Customers => vec![code(row, "customer_code")?],
        Entity::Products => vec![code(row, "sku")?],
        Entity::Inventory => vec![
            integer(row, "product_id").ok()??.to_string(),
            warehouse(row),
        ],
        Entity::PriceLists => vec![
            integer(row, "supplier_id").ok()??.to_string(),
            integer(row, "product_id").ok()??.to_string(),
            valid_from(row).ok()?,
        ],
        Entity::UploadHistory => vec![legacy_id(row)?.to_string()],
    };
    Some(parts.join("|"))
}

pub fn legacy_id(row: &Row) -> Option<i64> {
    integer(row, "id").ok().flatten()
}

fn supplier(row: &Row) -> Result<Row, TransformError> {
    Ok(object(json!({
        "code": code(row, "supplier_code").ok_or(TransformError::MissingField("code"))?,
        "company_name": text(row, "company_name").ok_or(TransformError::MissingField("company_name"))?,
        "email": opt(email(row, "contact_email")?),
        "phone": opt(text(row, "phone")),
    })))
}

fn customer(row: &Row) -> Result<Row, TransformError> {
    Ok(object(json!({
        "code": code(row, "customer_code").ok_or(TransformError::MissingField("code"))?,
        "name": text(row, "name").ok_or(TransformError::MissingField("name"))?,
        "email": opt(email(row, "email")?),
        "phone": opt(text(row, "phone")),
        "address": opt(text(row, "address")),
    })))
}

fn product(row: &Row, lookups: &ForeignKeyLookups) -> Result<Row, TransformError> {
    let supplier_id = reference(row, "supplier_id", Entity::Suppliers, lookups)?;
    let price = decimal(row, "unit_price")?.ok_or(TransformError::MissingField("price_cents"))?;
    Ok(object(json!({
        "sku": code(row, "sku").ok_or(TransformError::MissingField("sku"))?,
        "name": text(row, "name").ok_or(TransformError::MissingField("name"))?,
        "supplier_id": supplier_id,
        "unit": opt(text(row, "unit").map(|u| u.to_lowercase())),
        "price_cents": to_cents(price)?,
    })))
}

fn inventory(row: &Row, lookups: &ForeignKeyLookups) -> Result<Row, TransformError> {
    let product_id = reference(row, "product_id", Entity::Products, lookups)?;
    let quantity = integer(row, "quantity")?.unwrap_or(0);
    if quantity < 0 {
        return Err(invalid("quantity", format!("negative quantity {quantity}")));
    }
    Ok(object(json!({
        "product_id": product_id,
        "warehouse": warehouse(row),
        "quantity": quantity,
    })))
}

fn price_list(row: &Row, lookups: &ForeignKeyLookups) -> Result<Row, TransformError> {
    let supplier_id = reference(row, "supplier_id", Entity::Suppliers, lookups)?;
    let product_id = reference(row, "product_id", Entity::Products, lookups)?;
    let price = decimal(row, "price")?.ok_or(TransformError::MissingField("price_cents"))?;
    let currency = text(row, "currency")
        .map(|c| c.to_uppercase())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid("currency", format!("'{currency}' is not an ISO 4217 code")));
    }
    Ok(object(json!({
        "supplier_id": supplier_id,
        "product_id": product_id,
        "price_cents": to_cents(price)?,
        "currency": currency,
        "valid_from": valid_from(row)?,
    })))
}

/// Uploads may outlive their supplier; dangling ids are reported by validation.
fn upload(row: &Row) -> Result<Row, TransformError> {
    let supplier_id = integer(row, "supplier_id")?;
    let file_name = text(row, "file_name").ok_or(TransformError::MissingField("file_name"))?;
    let file_type = text(row, "file_type")
        .map(|t| t.trim_start_matches('.').to_lowercase())
        .or_else(|| {
            std::path::Path::new(&file_name)
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
        });
    let status = match text(row, "status").map(|s| s.to_uppercase()).as_deref() {
        Some("OK" | "DONE" | "PROCESSED") => "processed",
        Some("ERR" | "ERROR" | "FAILED") => "failed",
        Some("PENDING" | "QUEUED") => "pending",
        Some(other) => return Err(invalid("status", format!("unknown upload status '{other}'"))),
        None => return Err(TransformError::MissingField("status")),
    };
    Ok(object(json!({
        "supplier_id": supplier_id,
        "file_name": file_name,
        "file_type": file_type,
        "status": status,
        "uploaded_at": opt(text(row, "uploaded_at").or_else(|| text(row, "created_at"))),
    })))
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn opt(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

/// Trimmed text; blank strings are absent. Numbers are rendered as text.
fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn code(row: &Row, column: &str) -> Option<String> {
    text(row, column).map(|c| c.to_uppercase())
}

fn warehouse(row: &Row) -> String {
    code(row, "warehouse").unwrap_or_else(|| DEFAULT_WAREHOUSE.to_string())
}

fn integer(row: &Row, column: &'static str) -> Result<Option<i64>, TransformError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| invalid(column, format!("{n} is not an integer"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(column, format!("'{s}' is not an integer"))),
        Some(other) => Err(invalid(column, format!("unexpected value {other}"))),
    }
}

fn decimal(row: &Row, column: &'static str) -> Result<Option<f64>, TransformError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse()
            .map(Some)
            .map_err(|_| invalid(column, format!("'{s}' is not a number"))),
        Some(other) => Err(invalid(column, format!("unexpected value {other}"))),
    }
}

fn reference(
    row: &Row,
    column: &'static str,
    parent: Entity,
    lookups: &ForeignKeyLookups,
) -> Result<i64, TransformError> {
    let id = integer(row, column)?.ok_or(TransformError::MissingField(column))?;
    lookups.check(column, parent, id)?;
    Ok(id)
}

fn email(row: &Row, column: &'static str) -> Result<Option<String>, TransformError> {
    match text(row, column) {
        None => Ok(None),
        Some(raw) if raw.contains('@') => Ok(Some(raw.to_lowercase())),
        Some(raw) => Err(invalid("email", format!("'{raw}' is not an email address"))),
    }
}

fn to_cents(price: f64) -> Result<i64, TransformError> {
    if !price.is_finite() || price < 0.0 {
        return Err(invalid("price_cents", format!("price {price} must be non-negative")));
    }
    Ok((price * 100.0).round() as i64)
}

fn date_part(raw: &str) -> Option<NaiveDate> {
    raw.get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

/// `YYYY-MM-DD`, defaulting to the legacy creation date.
fn valid_from(row: &Row) -> Result<String, TransformError> {
    let date = match text(row, "valid_from") {
        Some(raw) => date_part(&raw).ok_or_else(|| invalid("valid_from", format!("'{raw}' is not a date")))?,
        None => text(row, "created_at")
            .as_deref()
            .and_then(date_part)
            .ok_or(TransformError::MissingField("valid_from"))?,
    };
    Ok(date.format("%Y-%m-%d").to_string())
}
