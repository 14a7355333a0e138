//! Validation of operator-supplied identifiers and values.
//!
//! Entity names, write modes and timestamps arrive as free text from the CLI
//! or config files; they are parsed into closed types here before any of them
//! can reach a query.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use thiserror::Error;

use crate::models::Entity;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error(
        "Invalid entity: '{0}'. Valid values: suppliers, customers, products, inventory, price_lists, upload_history"
    )]
    InvalidEntity(String),

    #[error("Invalid write mode: '{0}'. Valid values: insert, upsert")]
    InvalidWriteMode(String),

    #[error("Invalid timestamp: '{0}'. Expected RFC 3339 (2025-01-31T12:00:00Z) or a date (2025-01-31)")]
    InvalidTimestamp(String),
}

/// Parse a comma-separated entity list such as `suppliers,products`.
pub fn parse_entity_list(raw: &str) -> Result<Vec<Entity>, ValidationError> {
    let mut entities = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let entity: Entity = part.parse()?;
        if !entities.contains(&entity) {
            entities.push(entity);
        }
    }
    Ok(entities)
}

/// Parse an RFC 3339 timestamp or a bare date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ValidationError::InvalidTimestamp(raw.to_string()))
}

/// Canonical text form of timestamps stored in `created_at` columns.
///
/// Fixed width with microsecond precision so lexical order equals time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_entity_list() {
        let entities = parse_entity_list("suppliers, products,suppliers,").unwrap();
        assert_eq!(entities, vec![Entity::Suppliers, Entity::Products]);
    }

    #[test]
    fn test_parse_entity_list_rejects_unknown() {
        let err = parse_entity_list("suppliers,orders").unwrap_err();
        assert_eq!(err, ValidationError::InvalidEntity("orders".to_string()));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-01-31").unwrap(), expected);
        assert_eq!(parse_timestamp("2025-01-31T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2025-01-31T01:00:00+01:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_format_timestamp_sorts_lexically() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let (fa, fb, fc) = (format_timestamp(&a), format_timestamp(&b), format_timestamp(&c));
        assert_eq!(fa, "2025-01-01T09:00:00.000000Z");
        assert!(fa < fb && fb < fc);
    }
}
