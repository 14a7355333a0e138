//! Final run reports and the JSON report sink.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::info;
use ts_rs::TS;
use uuid::Uuid;

use super::{
    rollback::{RollbackReport, RollbackTrigger},
    session::{EntityMigrationState, EntityStatus, MigrationSession, MigrationStats},
    validation::{ValidationFinding, has_critical, has_warnings},
};

/// Format version of persisted reports.
pub const REPORT_VERSION: u32 = 1;

const MIGRATION_PREFIX: &str = "migration_report_";
const ROLLBACK_PREFIX: &str = "rollback_report_";
const REPORT_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum OverallStatus {
    Success,
    CompletedWithWarnings,
    Failed,
}

impl OverallStatus {
    /// `FAILED` on any critical finding or failed entity,
    /// `COMPLETED_WITH_WARNINGS` on any warning or failed record.
    pub fn evaluate(entities: &[EntityMigrationState], findings: &[ValidationFinding]) -> Self {
        if has_critical(findings) || entities.iter().any(|e| e.status == EntityStatus::Failed) {
            OverallStatus::Failed
        } else if has_warnings(findings) || entities.iter().any(|e| e.failed > 0) {
            OverallStatus::CompletedWithWarnings
        } else {
            OverallStatus::Success
        }
    }
}

/// Outcome of the rollback that followed a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RollbackSummary {
    pub strategy: String,
    pub trigger: RollbackTrigger,
    pub report: Option<RollbackReport>,
    /// Set when the rollback could not start.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MigrationReport {
    pub version: u32,
    pub session_id: Uuid,
    #[ts(type = "Date")]
    pub started_at: DateTime<Utc>,
    #[ts(type = "Date")]
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub status: OverallStatus,
    pub entities: Vec<EntityMigrationState>,
    pub stats: MigrationStats,
    pub findings: Vec<ValidationFinding>,
    pub error: Option<String>,
    pub rollback: Option<RollbackSummary>,
}

impl MigrationReport {
    /// Freeze `session` into a report. The session's end time and stats are
    /// filled in first.
    pub fn from_session(
        session: &mut MigrationSession,
        error: Option<String>,
        rollback: Option<RollbackSummary>,
    ) -> Self {
        let finished_at = *session.finished_at.get_or_insert_with(Utc::now);
        session.refresh_stats();

        let mut status = OverallStatus::evaluate(&session.entities, &session.findings);
        if error.is_some() {
            status = OverallStatus::Failed;
        }
        Self {
            version: REPORT_VERSION,
            session_id: session.id,
            started_at: session.started_at,
            finished_at,
            dry_run: session.config.dry_run,
            status,
            entities: session.entities.clone(),
            stats: session.stats.clone(),
            findings: session.findings.clone(),
            error,
            rollback,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != OverallStatus::Failed
    }

    /// Re-raise a failed run as an error.
    pub fn into_result(self) -> anyhow::Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let reason = self
            .error
            .clone()
            .or_else(|| {
                self.findings
                    .iter()
                    .find(|f| f.is_critical())
                    .map(|f| format!("{}: {}", f.code, f.message))
            })
            .unwrap_or_else(|| "one or more entities failed".to_string());
        Err(anyhow::anyhow!("migration {} failed: {reason}", self.session_id))
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unsupported report version {found} (expected {REPORT_VERSION})")]
    UnsupportedVersion { found: u32 },
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Writes reports as timestamped JSON files into one directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Reports under `MIGRATE_REPORT_DIR` or the default data directory.
    pub fn default_location() -> Self {
        Self::new(utils::assets::report_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_migration(&self, report: &MigrationReport) -> Result<PathBuf, ReportError> {
        let name = format!(
            "{MIGRATION_PREFIX}{}_{}{REPORT_SUFFIX}",
            report.finished_at.format("%Y%m%d_%H%M%S_%3f"),
            short_id(report.session_id)
        );
        self.write(&name, report)
    }

    pub fn write_rollback(&self, report: &RollbackReport) -> Result<PathBuf, ReportError> {
        let name = format!(
            "{ROLLBACK_PREFIX}{}_{}{REPORT_SUFFIX}",
            report.finished_at.format("%Y%m%d_%H%M%S_%3f"),
            short_id(report.id)
        );
        self.write(&name, report)
    }

    pub fn latest_migration(&self) -> Result<Option<MigrationReport>, ReportError> {
        self.latest(MIGRATION_PREFIX)
    }

    pub fn latest_rollback(&self) -> Result<Option<RollbackReport>, ReportError> {
        self.latest(ROLLBACK_PREFIX)
    }

    /// Written to a temporary file first so readers never see a partial report.
    fn write<T: Serialize>(&self, name: &str, report: &T) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
        std::fs::rename(&tmp, &path)?;
        info!(path = %path.display(), "Report written");
        Ok(path)
    }

    /// Report paths with `prefix`, newest first.
    fn list(&self, prefix: &str) -> Result<Vec<PathBuf>, ReportError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix) && n.ends_with(REPORT_SUFFIX))
            })
            .collect();
        // Timestamped names sort chronologically.
        paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(paths)
    }

    fn latest<T: DeserializeOwned>(&self, prefix: &str) -> Result<Option<T>, ReportError> {
        let Some(path) = self.list(prefix)?.into_iter().next() else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(&path)?;
        let probe: VersionProbe = serde_json::from_str(&raw)?;
        if probe.version != REPORT_VERSION {
            return Err(ReportError::UnsupportedVersion {
                found: probe.version,
            });
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use db::models::Entity;
    use tempfile::TempDir;

    use super::*;
    use crate::services::{
        config::MigrationConfig,
        validation::{FindingKind, Severity},
    };

    fn session() -> MigrationSession {
        let mut session = MigrationSession::new(MigrationConfig::default());
        for state in &mut session.entities {
            state.status = EntityStatus::Completed;
            state.total = 10;
            state.migrated = 10;
        }
        session
    }

    fn finding(severity: Severity) -> ValidationFinding {
        ValidationFinding::new(FindingKind::InvalidData, "INVALID_CUSTOMERS_DATA", severity, "x")
    }

    #[test]
    fn test_overall_status() {
        let mut session = session();
        assert_eq!(
            MigrationReport::from_session(&mut session, None, None).status,
            OverallStatus::Success
        );

        session.entities[0].failed = 1;
        session.entities[0].migrated = 9;
        assert_eq!(
            MigrationReport::from_session(&mut session, None, None).status,
            OverallStatus::CompletedWithWarnings
        );

        session.findings.push(finding(Severity::Critical));
        assert_eq!(
            MigrationReport::from_session(&mut session, None, None).status,
            OverallStatus::Failed
        );
    }

    #[test]
    fn test_failed_entity_fails_report() {
        let mut session = session();
        session.entities[2].status = EntityStatus::Failed;
        let report = MigrationReport::from_session(&mut session, None, None);
        assert_eq!(report.status, OverallStatus::Failed);
        assert_eq!(report.stats.entities_failed, 1);
    }

    #[test]
    fn test_into_result() {
        let mut session = session();
        session.findings.push(finding(Severity::Warning));
        assert!(
            MigrationReport::from_session(&mut session, None, None)
                .into_result()
                .is_ok()
        );

        let err = MigrationReport::from_session(&mut session, Some("boom".into()), None)
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&OverallStatus::CompletedWithWarnings).unwrap(),
            "\"COMPLETED_WITH_WARNINGS\""
        );
    }

    #[test]
    fn test_write_and_load_latest() {
        let temp = TempDir::new().unwrap();
        let writer = ReportWriter::new(temp.path().join("reports"));
        assert!(writer.latest_migration().unwrap().is_none());

        let mut first = session();
        let first = MigrationReport::from_session(&mut first, None, None);
        writer.write_migration(&first).unwrap();

        let mut second = session();
        second.finished_at = Some(first.finished_at + chrono::Duration::seconds(1));
        second.entities.retain(|e| e.entity == Entity::Customers);
        let second = MigrationReport::from_session(&mut second, None, None);
        let path = writer.write_migration(&second).unwrap();

        assert!(path.file_name().unwrap().to_str().unwrap().starts_with(MIGRATION_PREFIX));
        assert_eq!(writer.latest_migration().unwrap(), Some(second));
        assert!(writer.latest_rollback().unwrap().is_none());
        // No temporary files left behind
        assert_eq!(std::fs::read_dir(writer.dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let writer = ReportWriter::new(temp.path());
        let mut session = session();
        let mut report = MigrationReport::from_session(&mut session, None, None);
        report.version = REPORT_VERSION + 1;
        writer.write_migration(&report).unwrap();

        assert!(matches!(
            writer.latest_migration(),
            Err(ReportError::UnsupportedVersion { found }) if found == REPORT_VERSION + 1
        ));
    }
}
