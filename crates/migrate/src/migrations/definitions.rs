//! Migration Definitions - Core types shared by the migration components
//!
//! Records, history entries, status reports and the per-file state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lint::LintIssue;

/// Config key preserved across an emergency reset
pub const SYSTEM_VERSION_KEY: &str = "migration_system_version";
/// Version written by `ensure_table`
pub const SYSTEM_VERSION: &str = "2.0";
/// Config key flagging a database that predates the tracking system
pub const PRODUCTION_DETECTED_KEY: &str = "production_database_detected";

/// Extract the informational migration id from a filename.
///
/// `20240115_001_add_ships.sql` → `20240115_001`, `007_add_ships.sql` → `007`,
/// anything else → the filename without `.sql`.
pub fn migration_id(filename: &str) -> String {
    let bytes = filename.as_bytes();
    let is_dated = bytes.len() > 13
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'_'
        && bytes[9..12].iter().all(u8::is_ascii_digit)
        && bytes[12] == b'_';
    if is_dated {
        return filename[..12].to_string();
    }

    let digits = filename.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 && bytes.get(digits) == Some(&b'_') {
        return filename[..digits].to_string();
    }

    filename.strip_suffix(".sql").unwrap_or(filename).to_string()
}

/// One applied (or manually marked) migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub filename: String,
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    pub applied_by: Option<String>,
    pub notes: Option<String>,
    pub is_manual_marking: bool,
    pub checksum: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// Values for a record about to be inserted; `applied_at` is set by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMigrationRecord {
    pub filename: String,
    pub migration_id: String,
    pub applied_by: Option<String>,
    pub notes: Option<String>,
    pub is_manual_marking: bool,
    pub checksum: Option<String>,
    pub execution_time_ms: Option<i64>,
}

impl NewMigrationRecord {
    /// Record for a migration whose SQL was executed
    pub fn executed(filename: &str, applied_by: &str, checksum: String, execution_time_ms: i64) -> Self {
        Self {
            filename: filename.to_string(),
            migration_id: migration_id(filename),
            applied_by: Some(applied_by.to_string()),
            notes: None,
            is_manual_marking: false,
            checksum: Some(checksum),
            execution_time_ms: Some(execution_time_ms),
        }
    }

    /// Record for an administrative marking; no SQL ran
    pub fn marked(filename: &str, options: &MarkOptions, checksum: Option<String>) -> Self {
        Self {
            filename: filename.to_string(),
            migration_id: migration_id(filename),
            applied_by: Some(options.applied_by_or_default().to_string()),
            notes: Some(options.notes_or_default().to_string()),
            is_manual_marking: true,
            checksum,
            execution_time_ms: None,
        }
    }

    /// Materialize the record as the store would return it
    pub fn into_record(self, applied_at: DateTime<Utc>) -> MigrationRecord {
        MigrationRecord {
            filename: self.filename,
            migration_id: self.migration_id,
            applied_at,
            applied_by: self.applied_by,
            notes: self.notes,
            is_manual_marking: self.is_manual_marking,
            checksum: self.checksum,
            execution_time_ms: self.execution_time_ms,
        }
    }
}

/// Options for `mark_applied`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkOptions {
    pub applied_by: Option<String>,
    pub notes: Option<String>,
}

impl MarkOptions {
    pub fn applied_by_or_default(&self) -> &str {
        match self.applied_by.as_deref().map(str::trim) {
            Some(actor) if !actor.is_empty() => actor,
            _ => "manual_marking",
        }
    }

    pub fn notes_or_default(&self) -> &str {
        match self.notes.as_deref().map(str::trim) {
            Some(notes) if !notes.is_empty() => notes,
            _ => "Manually marked as applied",
        }
    }
}

/// What an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Apply,
    MarkApplied,
    Reset,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Apply => "apply",
            HistoryAction::MarkApplied => "mark_applied",
            HistoryAction::Reset => "reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "apply" => Some(HistoryAction::Apply),
            "mark_applied" => Some(HistoryAction::MarkApplied),
            "reset" => Some(HistoryAction::Reset),
            _ => None,
        }
    }
}

/// Outcome of an audited attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Running,
    Success,
    Failure,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Running => "running",
            HistoryStatus::Success => "success",
            HistoryStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(HistoryStatus::Running),
            "success" => Some(HistoryStatus::Success),
            "failure" => Some(HistoryStatus::Failure),
            _ => None,
        }
    }
}

/// Row of the audit table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub migration_id: String,
    pub filename: String,
    pub action: HistoryAction,
    pub status: HistoryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub applied_by: Option<String>,
}

/// Audit row about to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub migration_id: String,
    pub filename: String,
    pub action: HistoryAction,
    pub status: HistoryStatus,
    pub applied_by: Option<String>,
}

/// Completion data for an audit row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryOutcome {
    pub status: HistoryStatus,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
}

/// Per-file lifecycle, observed through `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Not present in the catalog
    Unknown,
    /// In the catalog, no record
    Pending,
    /// Record exists and the SQL was executed
    Applied,
    /// Record exists from a manual marking
    Marked,
}

/// How the executor ran a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Whole file in one transaction together with its record
    Transactional,
    /// Statement by statement without a transaction, record afterwards
    NonTransactional,
}

/// Result of applying one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub filename: String,
    pub strategy: ExecutionStrategy,
    pub statements_executed: usize,
    pub execution_time_ms: i64,
    pub checksum: String,
}

/// Result of running migrations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Migrations applied in this run, in order
    pub applied: Vec<AppliedMigration>,
    /// Number of migrations already applied before the run
    pub skipped_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: i64,
}

impl RunReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Comprehensive status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub total: usize,
    pub applied_count: usize,
    /// Catalog files without a record, in execution order
    pub pending: Vec<String>,
    pub applied_list: Vec<MigrationRecord>,
    pub available_list: Vec<String>,
    /// Records whose file no longer exists
    pub orphaned: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub is_production_database: bool,
    pub migration_system_version: String,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Lifecycle state of one filename according to this snapshot
    pub fn state_of(&self, filename: &str) -> MigrationState {
        if let Some(record) = self.applied_list.iter().find(|r| r.filename == filename) {
            if record.is_manual_marking {
                return MigrationState::Marked;
            }
            return MigrationState::Applied;
        }
        if self.available_list.iter().any(|f| f == filename) {
            MigrationState::Pending
        } else {
            MigrationState::Unknown
        }
    }
}

/// Per-file row of the detail view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationDetail {
    pub id: String,
    pub filename: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub is_manual_marking: bool,
    pub state: MigrationState,
}

/// Per-file result of `validate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileValidation {
    pub filename: String,
    pub migration_id: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub strategy: ExecutionStrategy,
    pub issues: Vec<LintIssue>,
    pub applied: bool,
    /// `None` when not applied or applied without a stored checksum
    pub checksum_matches: Option<bool>,
}

/// Contents and fingerprint of one migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSource {
    pub filename: String,
    pub contents: String,
    /// SHA-256, lowercase hex
    pub checksum: String,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_id_extraction() {
        assert_eq!(migration_id("001_create_loot.sql"), "001");
        assert_eq!(migration_id("20240115_002_add_ships.sql"), "20240115_002");
        assert_eq!(migration_id("20240115_add_ships.sql"), "20240115");
        assert_eq!(migration_id("add_ships.sql"), "add_ships");
        assert_eq!(migration_id("42.sql"), "42");
    }

    #[test]
    fn test_mark_options_defaults() {
        let options = MarkOptions::default();
        assert_eq!(options.applied_by_or_default(), "manual_marking");
        assert_eq!(options.notes_or_default(), "Manually marked as applied");

        let blank = MarkOptions {
            applied_by: Some("   ".to_string()),
            notes: Some("restored from backup".to_string()),
        };
        assert_eq!(blank.applied_by_or_default(), "manual_marking");
        assert_eq!(blank.notes_or_default(), "restored from backup");
    }

    #[test]
    fn test_history_enums_round_trip_through_strings() {
        for action in [HistoryAction::Apply, HistoryAction::MarkApplied, HistoryAction::Reset] {
            assert_eq!(HistoryAction::parse(action.as_str()), Some(action));
        }
        for status in [HistoryStatus::Running, HistoryStatus::Success, HistoryStatus::Failure] {
            assert_eq!(HistoryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HistoryAction::parse("rollback"), None);
    }

    #[test]
    fn test_state_of() {
        let marked = NewMigrationRecord::marked("002_b.sql", &MarkOptions::default(), None).into_record(Utc::now());
        let applied = NewMigrationRecord::executed("001_a.sql", "migration_runner", "abc".into(), 3)
            .into_record(Utc::now());
        let status = MigrationStatus {
            total: 3,
            applied_count: 2,
            pending: vec!["003_c.sql".to_string()],
            applied_list: vec![applied, marked],
            available_list: vec!["001_a.sql".into(), "002_b.sql".into(), "003_c.sql".into()],
            orphaned: Vec::new(),
            config: BTreeMap::new(),
            is_production_database: false,
            migration_system_version: SYSTEM_VERSION.to_string(),
        };

        assert_eq!(status.state_of("001_a.sql"), MigrationState::Applied);
        assert_eq!(status.state_of("002_b.sql"), MigrationState::Marked);
        assert_eq!(status.state_of("003_c.sql"), MigrationState::Pending);
        assert_eq!(status.state_of("999_z.sql"), MigrationState::Unknown);
        assert!(!status.is_up_to_date());
    }
}
