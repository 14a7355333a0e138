//! The closed set of migrated entities and their table mappings.
//!
//! Table and column identifiers used in SQL come exclusively from this module,
//! never from operator input.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::validation::ValidationError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Entity {
    Suppliers,
    Customers,
    Products,
    Inventory,
    PriceLists,
    UploadHistory,
}

/// Stable pagination order for legacy tables.
pub const LEGACY_SORT_KEY: &[&str] = &["created_at", "id"];

/// Pagination order for target and backup tables.
pub const TARGET_SORT_KEY: &[&str] = &["id"];

/// Columns stamped by the writer, excluded from upsert updates where noted.
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

impl Entity {
    /// Declaration order; used as the tie-breaker for dependency ordering.
    pub const ALL: [Entity; 6] = [
        Entity::Suppliers,
        Entity::Customers,
        Entity::Products,
        Entity::Inventory,
        Entity::PriceLists,
        Entity::UploadHistory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Entity::Suppliers => "suppliers",
            Entity::Customers => "customers",
            Entity::Products => "products",
            Entity::Inventory => "inventory",
            Entity::PriceLists => "price_lists",
            Entity::UploadHistory => "upload_history",
        }
    }

    pub fn legacy_table(self) -> &'static str {
        match self {
            Entity::Suppliers => "legacy_suppliers",
            Entity::Customers => "legacy_customers",
            Entity::Products => "legacy_products",
            Entity::Inventory => "legacy_inventory",
            Entity::PriceLists => "legacy_price_lists",
            Entity::UploadHistory => "legacy_uploads",
        }
    }

    pub fn target_table(self) -> &'static str {
        self.name()
    }

    /// Upper-case plural label used in finding codes (`ORPHANED_PRODUCTS`).
    pub fn label(self) -> &'static str {
        match self {
            Entity::Suppliers => "SUPPLIERS",
            Entity::Customers => "CUSTOMERS",
            Entity::Products => "PRODUCTS",
            Entity::Inventory => "INVENTORY",
            Entity::PriceLists => "PRICE_LISTS",
            Entity::UploadHistory => "UPLOAD_HISTORY",
        }
    }

    /// Upper-case singular label used in field finding codes (`MISSING_SUPPLIER_NAME`).
    pub fn singular_label(self) -> &'static str {
        match self {
            Entity::Suppliers => "SUPPLIER",
            Entity::Customers => "CUSTOMER",
            Entity::Products => "PRODUCT",
            Entity::Inventory => "INVENTORY",
            Entity::PriceLists => "PRICE_LIST",
            Entity::UploadHistory => "UPLOAD",
        }
    }

    /// Business key identifying a record in the target, used for upserts and
    /// duplicate detection.
    pub fn natural_key(self) -> &'static [&'static str] {
        match self {
            Entity::Suppliers | Entity::Customers => &["code"],
            Entity::Products => &["sku"],
            Entity::Inventory => &["product_id", "warehouse"],
            Entity::PriceLists => &["supplier_id", "product_id", "valid_from"],
            Entity::UploadHistory => &["id"],
        }
    }

    /// Legacy columns holding the natural key before normalisation.
    pub fn legacy_natural_key(self) -> &'static [&'static str] {
        match self {
            Entity::Suppliers => &["supplier_code"],
            Entity::Customers => &["customer_code"],
            Entity::Products => &["sku"],
            Entity::Inventory => &["product_id", "warehouse"],
            Entity::PriceLists => &["supplier_id", "product_id", "valid_from"],
            Entity::UploadHistory => &["id"],
        }
    }

    /// Dependencies implied by the relationships below.
    pub fn default_dependencies(self) -> &'static [Entity] {
        match self {
            Entity::Suppliers | Entity::Customers => &[],
            Entity::Products => &[Entity::Suppliers],
            Entity::Inventory => &[Entity::Products],
            Entity::PriceLists => &[Entity::Suppliers, Entity::Products],
            Entity::UploadHistory => &[Entity::Suppliers],
        }
    }

    pub fn legacy_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Suppliers => &[
                "id",
                "supplier_code",
                "company_name",
                "contact_email",
                "phone",
                "created_at",
            ],
            Entity::Customers => &[
                "id",
                "customer_code",
                "name",
                "email",
                "phone",
                "address",
                "created_at",
            ],
            Entity::Products => &[
                "id",
                "sku",
                "name",
                "supplier_id",
                "unit",
                "unit_price",
                "created_at",
            ],
            Entity::Inventory => &["id", "product_id", "warehouse", "quantity", "created_at"],
            Entity::PriceLists => &[
                "id",
                "supplier_id",
                "product_id",
                "price",
                "currency",
                "valid_from",
                "created_at",
            ],
            Entity::UploadHistory => &[
                "id",
                "supplier_id",
                "file_name",
                "file_type",
                "status",
                "uploaded_at",
                "created_at",
            ],
        }
    }

    pub fn target_columns(self) -> &'static [&'static str] {
        match self {
            Entity::Suppliers => &[
                "id",
                "code",
                "company_name",
                "email",
                "phone",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
            Entity::Customers => &[
                "id",
                "code",
                "name",
                "email",
                "phone",
                "address",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
            Entity::Products => &[
                "id",
                "sku",
                "name",
                "supplier_id",
                "unit",
                "price_cents",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
            Entity::Inventory => &[
                "id",
                "product_id",
                "warehouse",
                "quantity",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
            Entity::PriceLists => &[
                "id",
                "supplier_id",
                "product_id",
                "price_cents",
                "currency",
                "valid_from",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
            Entity::UploadHistory => &[
                "id",
                "supplier_id",
                "file_name",
                "file_type",
                "status",
                "uploaded_at",
                "source_created_at",
                "created_at",
                "updated_at",
            ],
        }
    }

    /// Non-nullable business fields of the target record.
    pub fn required_target_fields(self) -> &'static [&'static str] {
        match self {
            Entity::Suppliers => &["code", "company_name"],
            Entity::Customers => &["code", "name"],
            Entity::Products => &["sku", "name", "supplier_id", "price_cents"],
            Entity::Inventory => &["product_id", "warehouse", "quantity"],
            Entity::PriceLists => &["supplier_id", "product_id", "price_cents", "currency"],
            Entity::UploadHistory => &["file_name", "status"],
        }
    }

    /// Relationships in which this entity is the child.
    pub fn parent_relationships(self) -> impl Iterator<Item = &'static Relationship> {
        RELATIONSHIPS.iter().filter(move |r| r.child == self)
    }

    /// Relationships in which this entity is the parent.
    pub fn child_relationships(self) -> impl Iterator<Item = &'static Relationship> {
        RELATIONSHIPS.iter().filter(move |r| r.parent == self)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Entity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        Entity::ALL
            .into_iter()
            .find(|e| e.name() == needle)
            .ok_or_else(|| ValidationError::InvalidEntity(s.to_string()))
    }
}

/// A concrete table in the source, target or backup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Legacy(Entity),
    Target(Entity),
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Legacy(e) => e.legacy_table(),
            Table::Target(e) => e.target_table(),
        }
    }

    pub fn entity(self) -> Entity {
        match self {
            Table::Legacy(e) | Table::Target(e) => e,
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Legacy(e) => e.legacy_columns(),
            Table::Target(e) => e.target_columns(),
        }
    }

    pub fn natural_key(self) -> &'static [&'static str] {
        match self {
            Table::Legacy(_) => &["id"],
            Table::Target(e) => e.natural_key(),
        }
    }

    pub fn sort_key(self) -> &'static [&'static str] {
        match self {
            Table::Legacy(_) => LEGACY_SORT_KEY,
            Table::Target(_) => TARGET_SORT_KEY,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A foreign key from `child.column` to `parent.id` in the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub child: Entity,
    pub column: &'static str,
    pub parent: Entity,
    /// Orphans of an enforced relationship are critical; others are warnings.
    pub enforced: bool,
}

pub const RELATIONSHIPS: &[Relationship] = &[
    Relationship {
        child: Entity::Products,
        column: "supplier_id",
        parent: Entity::Suppliers,
        enforced: true,
    },
    Relationship {
        child: Entity::Inventory,
        column: "product_id",
        parent: Entity::Products,
        enforced: true,
    },
    Relationship {
        child: Entity::PriceLists,
        column: "product_id",
        parent: Entity::Products,
        enforced: true,
    },
    Relationship {
        child: Entity::PriceLists,
        column: "supplier_id",
        parent: Entity::Suppliers,
        enforced: true,
    },
    Relationship {
        child: Entity::UploadHistory,
        column: "supplier_id",
        parent: Entity::Suppliers,
        enforced: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_names() {
        assert_eq!("suppliers".parse::<Entity>().unwrap(), Entity::Suppliers);
        assert_eq!("Price-Lists".parse::<Entity>().unwrap(), Entity::PriceLists);
        assert_eq!(
            " upload_history ".parse::<Entity>().unwrap(),
            Entity::UploadHistory
        );
        assert!("legacy_suppliers; DROP TABLE x".parse::<Entity>().is_err());
    }

    #[test]
    fn test_default_dependencies_match_relationships() {
        for entity in Entity::ALL {
            let mut from_relationships: Vec<Entity> =
                entity.parent_relationships().map(|r| r.parent).collect();
            from_relationships.sort();
            from_relationships.dedup();
            let mut declared = entity.default_dependencies().to_vec();
            declared.sort();
            assert_eq!(declared, from_relationships, "dependencies of {entity}");
        }
    }

    #[test]
    fn test_keys_and_required_fields_are_target_columns() {
        for entity in Entity::ALL {
            let columns = entity.target_columns();
            for key in entity.natural_key() {
                assert!(columns.contains(key), "{entity}.{key}");
            }
            for field in entity.required_target_fields() {
                assert!(columns.contains(field), "{entity}.{field}");
            }
            for key in entity.legacy_natural_key() {
                assert!(entity.legacy_columns().contains(key), "{entity}.{key}");
            }
        }
    }

    #[test]
    fn test_relationship_columns_exist() {
        for rel in RELATIONSHIPS {
            assert!(rel.child.target_columns().contains(&rel.column));
            assert!(rel.child.legacy_columns().contains(&rel.column));
        }
    }

    #[test]
    fn test_table_names() {
        assert_eq!(Table::Legacy(Entity::UploadHistory).name(), "legacy_uploads");
        assert_eq!(Table::Target(Entity::UploadHistory).name(), "upload_history");
        assert_eq!(Table::Legacy(Entity::Products).sort_key(), LEGACY_SORT_KEY);
    }
}
