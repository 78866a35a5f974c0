//! Admin operations
//!
//! Transport-neutral request and response shapes for operator tooling. An
//! HTTP layer or the CLI deserializes requests, calls these methods and
//! serializes the responses; [`MigrationError::status_code`] gives the status
//! class for failures. Authentication is the caller's concern.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, MigrationResult};
use super::definitions::{
    migration_id, FileValidation, HistoryEntry, MarkOptions, MigrationDetail, MigrationRecord, MigrationStatus,
    RunReport,
};
use super::orchestrator::Migrator;

/// Summary returned by the status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub total: usize,
    pub applied: usize,
    pub pending: Vec<String>,
    pub is_up_to_date: bool,
    pub is_production_database: bool,
    pub migration_system_version: String,
}

impl From<&MigrationStatus> for StatusResponse {
    fn from(status: &MigrationStatus) -> Self {
        Self {
            total: status.total,
            applied: status.applied_count,
            pending: status.pending.clone(),
            is_up_to_date: status.is_up_to_date(),
            is_production_database: status.is_production_database,
            migration_system_version: status.migration_system_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[serde(flatten)]
    pub status: StatusResponse,
    pub health_check: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailsResponse {
    #[serde(flatten)]
    pub status: StatusResponse,
    pub orphaned: Vec<String>,
    pub migrations: Vec<MigrationDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub before: StatusResponse,
    pub after: StatusResponse,
    pub result: RunReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAppliedRequest {
    pub filename: Option<String>,
    pub applied_by: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAppliedResponse {
    pub filename: String,
    pub migration_id: String,
    pub applied_by: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub migrations: Vec<MigrationRecord>,
    pub attempts: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub initialized: bool,
    pub migration_system_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// Backend kind, e.g. `postgresql`
    pub backend: String,
    /// Connection target with credentials redacted
    pub target: String,
    pub migrations_dir: String,
    pub rollback_dir: String,
    pub tracking_table: String,
    pub crate_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub config: BTreeMap<String, String>,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub files: Vec<FileValidation>,
    pub total_issues: usize,
    /// Applied files whose contents changed since they were applied
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub confirm_reset: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub removed: u64,
    pub message: String,
}

/// Operator-facing facade over a [`Migrator`]
#[derive(Clone)]
pub struct MigrationAdmin {
    migrator: Migrator,
}

impl MigrationAdmin {
    pub fn new(migrator: Migrator) -> Self {
        Self { migrator }
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub async fn status(&self) -> MigrationResult<StatusResponse> {
        Ok(StatusResponse::from(&self.migrator.status().await?))
    }

    /// Initialize the tracking tables, then report status
    pub async fn health(&self) -> MigrationResult<HealthResponse> {
        self.migrator.init().await?;
        Ok(HealthResponse {
            status: self.status().await?,
            health_check: "passed".to_string(),
        })
    }

    pub async fn details(&self) -> MigrationResult<DetailsResponse> {
        let status = self.migrator.status().await?;
        Ok(DetailsResponse {
            status: StatusResponse::from(&status),
            orphaned: status.orphaned.clone(),
            migrations: self.migrator.details().await?,
        })
    }

    /// Run pending migrations with before and after snapshots
    pub async fn run(&self) -> MigrationResult<RunResponse> {
        let before = self.status().await?;
        let result = self.migrator.run().await?;
        let after = self.status().await?;
        Ok(RunResponse { before, after, result })
    }

    pub async fn mark_applied(&self, request: MarkAppliedRequest) -> MigrationResult<MarkAppliedResponse> {
        let filename = match request.filename.as_deref().map(str::trim) {
            Some(filename) if !filename.is_empty() => filename.to_string(),
            _ => return Err(MigrationError::validation("filename is required")),
        };
        let options = MarkOptions {
            applied_by: request.applied_by,
            notes: request.notes,
        };

        self.migrator.mark_applied(&filename, &options).await?;
        Ok(MarkAppliedResponse {
            migration_id: migration_id(&filename),
            applied_by: options.applied_by_or_default().to_string(),
            notes: options.notes_or_default().to_string(),
            filename,
        })
    }

    /// Applied records and audit rows, optionally for one migration id or filename
    pub async fn history(&self, migration_id: Option<&str>) -> HistoryResponse {
        let filter = migration_id.map(str::trim).filter(|f| !f.is_empty());
        HistoryResponse {
            migrations: self.migrator.history(filter).await,
            attempts: self.migrator.attempts(filter).await,
        }
    }

    pub async fn init(&self) -> MigrationResult<InitResponse> {
        self.migrator.init().await?;
        let status = self.migrator.status().await?;
        Ok(InitResponse {
            initialized: true,
            migration_system_version: status.migration_system_version,
        })
    }

    pub async fn config(&self) -> ConfigResponse {
        let config = self.migrator.config();
        ConfigResponse {
            config: self.migrator.store().config().await,
            system: SystemInfo {
                backend: self.migrator.backend().backend_type().to_string(),
                target: self.migrator.backend().description(),
                migrations_dir: config.migrations_dir.display().to_string(),
                rollback_dir: config.rollback_dir().display().to_string(),
                tracking_table: config.migrations_table.clone(),
                crate_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub async fn validate(&self) -> MigrationResult<ValidateResponse> {
        let files = self.migrator.validate().await?;
        Ok(ValidateResponse {
            total_issues: files.iter().map(|f| f.issues.len()).sum(),
            modified: files
                .iter()
                .filter(|f| f.checksum_matches == Some(false))
                .map(|f| f.filename.clone())
                .collect(),
            files,
        })
    }

    /// Clear all tracking rows; requires `confirmReset: true`
    pub async fn emergency_reset(&self, request: ResetRequest) -> MigrationResult<ResetResponse> {
        if request.confirm_reset != Some(true) {
            return Err(MigrationError::validation(
                "Emergency reset requires confirmReset: true",
            ));
        }
        let removed = self.migrator.emergency_reset(true).await?;
        Ok(ResetResponse {
            removed,
            message: "Migration tracking reset. Re-run migrations or mark them as applied.".to_string(),
        })
    }
}
