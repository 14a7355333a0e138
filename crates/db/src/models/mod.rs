pub mod entity;

pub use entity::{Entity, RELATIONSHIPS, Relationship, Table};
