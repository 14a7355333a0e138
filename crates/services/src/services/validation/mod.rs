//! Validation gates.
//!
//! Both gates are read-only: they never write to either store, and on
//! unchanged data they return equal findings in equal order.

mod findings;
pub mod post_gate;
pub mod pre_gate;

pub use findings::{
    FindingKind, MAX_FINDING_SAMPLE, Severity, ValidationFinding, critical_count, has_critical,
    has_warnings,
};
pub use post_gate::{check_relationships, detect_problematic_tables, run_post_migration};
pub use pre_gate::run_pre_migration;
