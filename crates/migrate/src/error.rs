//! Error types for the migration system
//!
//! Every failure a caller can observe is a [`MigrationError`]. Database driver
//! errors are first captured as a backend-neutral [`DatabaseError`] and then
//! classified by the executor into the migration taxonomy.

use std::fmt;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Result type alias for raw backend calls
pub type DbResult<T> = Result<T, DatabaseError>;

/// SQLSTATE for `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `invalid_column_reference` (ON CONFLICT without a matching constraint)
pub const NO_MATCHING_CONSTRAINT: &str = "42P10";
/// SQLSTATE for `active_sql_transaction`
pub const ACTIVE_SQL_TRANSACTION: &str = "25001";

const UPSERT_HINT: &str = "This error often occurs when using ON CONFLICT without a matching unique constraint. \
     Add the constraint first or use INSERT ... WHERE NOT EXISTS instead.";
const DUPLICATE_DATA_HINT: &str = "Existing rows conflict with the new unique constraint or index. \
     Remove or merge the duplicate rows, then re-run the migration.";
const CONSTRAINT_DATA_HINT: &str = "Existing or inserted rows violate a constraint. \
     Check the data the migration touches against the constraint definition.";
const CONCURRENT_INDEX_HINT: &str = "CREATE INDEX CONCURRENTLY cannot run inside a transaction block. \
     The runner executes such migrations without a transaction; check for an explicit BEGIN around the statement.";

/// Error reported by a database backend, stripped of driver types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    pub message: String,
    /// SQLSTATE code when the server supplied one
    pub code: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the submitted statement
    pub position: Option<usize>,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }

    fn is_constraint_problem(&self) -> bool {
        match self.code.as_deref() {
            Some(NO_MATCHING_CONSTRAINT) => true,
            Some(code) if code.starts_with("23") => true,
            _ => self.message.contains("unique or exclusion constraint"),
        }
    }

    fn is_concurrent_index_in_transaction(&self) -> bool {
        if self.code.as_deref() == Some(ACTIVE_SQL_TRANSACTION) {
            return true;
        }
        let upper = self.message.to_uppercase();
        upper.contains("CONCURRENTLY") && upper.contains("TRANSACTION BLOCK")
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DatabaseError {}

/// Remediation text for a constraint failure, chosen by SQLSTATE
fn constraint_hint(code: &Option<String>, message: &str) -> &'static str {
    match code.as_deref() {
        Some(NO_MATCHING_CONSTRAINT) => UPSERT_HINT,
        Some(UNIQUE_VIOLATION) => DUPLICATE_DATA_HINT,
        Some(_) => CONSTRAINT_DATA_HINT,
        None if message.contains("unique or exclusion constraint") => UPSERT_HINT,
        None => CONSTRAINT_DATA_HINT,
    }
}

/// Driver error metadata attached to an execution failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub filename: String,
    pub message: String,
    pub code: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
    /// Index of the failing statement when executed statement-by-statement
    pub statement: Option<usize>,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to execute migration {}: {}{}",
            self.filename,
            self.message,
            location_suffix(self.statement, self.position)
        )
    }
}

/// ` (statement N) at position P`, with the statement index shown 1-based
fn location_suffix(statement: Option<usize>, position: Option<usize>) -> String {
    let mut suffix = String::new();
    if let Some(statement) = statement {
        suffix.push_str(&format!(" (statement {})", statement + 1));
    }
    if let Some(position) = position {
        suffix.push_str(&format!(" at position {}", position));
    }
    suffix
}

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Tracking tables or directories could not be prepared
    #[error("Migration setup failed: {0}")]
    SetupFailure(String),

    /// A record already exists for this filename
    #[error("Migration {filename} is already recorded as applied")]
    DuplicateMigration { filename: String },

    /// The migration violated (or referenced a missing) constraint
    #[error("Constraint violation in migration {filename}: {message}{}", location_suffix(*statement, *position))]
    ConstraintViolation {
        filename: String,
        message: String,
        code: Option<String>,
        detail: Option<String>,
        hint: String,
        position: Option<usize>,
        statement: Option<usize>,
    },

    /// The server refused a concurrent index build inside a transaction
    #[error("Concurrent index in transaction in migration {filename}: {message}{}", location_suffix(*statement, *position))]
    ConcurrentIndexInTransaction {
        filename: String,
        message: String,
        hint: String,
        position: Option<usize>,
        statement: Option<usize>,
    },

    /// Any other SQL failure
    #[error("{0}")]
    ExecutionFailure(Box<ExecutionFailure>),

    /// Caller input problem; raised before touching the database
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Classify a failure raised while executing migration SQL.
    pub fn from_execution(filename: &str, err: DatabaseError, statement: Option<usize>) -> Self {
        if err.is_concurrent_index_in_transaction() {
            return Self::ConcurrentIndexInTransaction {
                filename: filename.to_string(),
                message: err.message,
                hint: CONCURRENT_INDEX_HINT.to_string(),
                position: err.position,
                statement,
            };
        }
        if err.is_constraint_problem() {
            let hint = err.hint.unwrap_or_else(|| constraint_hint(&err.code, &err.message).to_string());
            return Self::ConstraintViolation {
                filename: filename.to_string(),
                message: err.message,
                code: err.code,
                detail: err.detail,
                hint,
                position: err.position,
                statement,
            };
        }
        Self::ExecutionFailure(Box::new(ExecutionFailure {
            filename: filename.to_string(),
            message: err.message,
            code: err.code,
            detail: err.detail,
            hint: err.hint,
            position: err.position,
            statement,
        }))
    }

    /// Classify a failure raised while inserting the tracking record.
    pub fn from_record(filename: &str, err: DatabaseError) -> Self {
        if err.is_unique_violation() {
            Self::DuplicateMigration {
                filename: filename.to_string(),
            }
        } else {
            Self::from_execution(filename, err, None)
        }
    }

    /// Remediation hint, if the failure carries one
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::ConstraintViolation { hint, .. } | Self::ConcurrentIndexInTransaction { hint, .. } => {
                Some(hint.as_str())
            }
            Self::ExecutionFailure(failure) => failure.hint.as_deref(),
            _ => None,
        }
    }

    /// Server-provided detail, if any
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::ConstraintViolation { detail, .. } => detail.as_deref(),
            Self::ExecutionFailure(failure) => failure.detail.as_deref(),
            _ => None,
        }
    }

    /// Zero-based index of the failing statement for statement-by-statement runs
    pub fn statement(&self) -> Option<usize> {
        match self {
            Self::ConstraintViolation { statement, .. } | Self::ConcurrentIndexInTransaction { statement, .. } => {
                *statement
            }
            Self::ExecutionFailure(failure) => failure.statement,
            _ => None,
        }
    }

    /// HTTP status class for the transport layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::DuplicateMigration { .. } => 409,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_on_record_is_duplicate() {
        let err = DatabaseError::new("duplicate key value violates unique constraint").with_code(UNIQUE_VIOLATION);
        match MigrationError::from_record("001_a.sql", err) {
            MigrationError::DuplicateMigration { filename } => assert_eq!(filename, "001_a.sql"),
            other => panic!("Expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_on_conflict_without_constraint_carries_hint() {
        let err = DatabaseError::new(
            "there is no unique or exclusion constraint matching the ON CONFLICT specification",
        );
        let classified = MigrationError::from_execution("002_b.sql", err, None);
        assert!(matches!(classified, MigrationError::ConstraintViolation { .. }));
        assert!(classified.hint().unwrap().contains("WHERE NOT EXISTS"));
    }

    #[test]
    fn test_constraint_hint_follows_sqlstate() {
        let upsert = MigrationError::from_execution(
            "002_b.sql",
            DatabaseError::new("no matching constraint").with_code(NO_MATCHING_CONSTRAINT),
            None,
        );
        assert!(upsert.hint().unwrap().contains("ON CONFLICT"));

        let duplicate = MigrationError::from_execution(
            "003_c.sql",
            DatabaseError::new("could not create unique index \"idx_loot_name\"")
                .with_code(UNIQUE_VIOLATION)
                .with_detail("Key (name)=(sword) is duplicated."),
            Some(1),
        );
        assert!(duplicate.hint().unwrap().contains("duplicate rows"));
        assert!(!duplicate.hint().unwrap().contains("ON CONFLICT"));
        assert_eq!(duplicate.detail(), Some("Key (name)=(sword) is duplicated."));
        assert!(duplicate.to_string().contains("(statement 2)"));

        let not_null = MigrationError::from_execution(
            "004_d.sql",
            DatabaseError::new("null value in column").with_code("23502"),
            None,
        );
        assert!(!not_null.hint().unwrap().contains("ON CONFLICT"));
    }

    #[test]
    fn test_concurrent_index_in_transaction_detected() {
        let err = DatabaseError::new("CREATE INDEX CONCURRENTLY cannot run inside a transaction block")
            .with_code(ACTIVE_SQL_TRANSACTION);
        let classified = MigrationError::from_execution("003_c.sql", err, None);
        assert!(matches!(classified, MigrationError::ConcurrentIndexInTransaction { .. }));
        assert!(classified.hint().is_some());
    }

    #[test]
    fn test_generic_failure_keeps_driver_metadata() {
        let err = DatabaseError::new("syntax error at or near \"TABLEE\"")
            .with_code("42601")
            .with_detail("some detail")
            .with_position(8);
        let classified = MigrationError::from_execution("004_d.sql", err, Some(2));
        match &classified {
            MigrationError::ExecutionFailure(failure) => {
                assert_eq!(failure.code.as_deref(), Some("42601"));
                assert_eq!(failure.position, Some(8));
                assert_eq!(failure.statement, Some(2));
            }
            other => panic!("Expected execution failure, got {:?}", other),
        }
        let message = classified.to_string();
        assert!(message.contains("004_d.sql"));
        assert!(message.contains("statement 3"));
        assert_eq!(classified.detail(), Some("some detail"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(MigrationError::validation("x").status_code(), 400);
        assert_eq!(
            MigrationError::DuplicateMigration { filename: "a".into() }.status_code(),
            409
        );
        assert_eq!(MigrationError::SetupFailure("x".into()).status_code(), 500);
    }
}
