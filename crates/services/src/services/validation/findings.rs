use db::models::Entity;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Offending keys kept per finding.
pub const MAX_FINDING_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum FindingKind {
    DuplicateKey,
    MissingRequiredField,
    OrphanedReference,
    RecordCountMismatch,
    InvalidData,
    SchemaMissing,
    Connectivity,
    EntityFailed,
    Timeout,
    Cancelled,
    RollbackVerification,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One typed result of a validation gate or of rollback verification.
///
/// Findings carry no timestamps: running a gate twice over unchanged data
/// yields equal findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ValidationFinding {
    pub kind: FindingKind,
    /// Specific code such as `MISSING_SUPPLIER_NAME` or `ORPHANED_PRODUCTS`.
    pub code: String,
    pub severity: Severity,
    pub entity: Option<Entity>,
    pub count: u64,
    /// Sorted sample of offending keys, at most [`MAX_FINDING_SAMPLE`].
    pub sample: Vec<String>,
    pub message: String,
}

impl ValidationFinding {
    pub fn new(
        kind: FindingKind,
        code: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            severity,
            entity: None,
            count: 1,
            sample: Vec::new(),
            message: message.into(),
        }
    }

    pub fn for_entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_sample<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let mut sample: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
        sample.sort();
        sample.dedup();
        sample.truncate(MAX_FINDING_SAMPLE);
        self.sample = sample;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

pub fn has_critical(findings: &[ValidationFinding]) -> bool {
    findings.iter().any(ValidationFinding::is_critical)
}

pub fn critical_count(findings: &[ValidationFinding]) -> usize {
    findings.iter().filter(|f| f.is_critical()).count()
}

pub fn has_warnings(findings: &[ValidationFinding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Warning)
}
