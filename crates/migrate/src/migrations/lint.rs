//! Advisory checks run before a migration executes
//!
//! Findings are logged and returned to the caller; they never block execution.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::splitter::{has_transaction_control, is_concurrent_index};

static ON_CONFLICT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bon\s+conflict\b").expect("valid pattern"));
static CREATE_IF_NOT_EXISTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcreate\s+table\s+if\s+not\s+exists\b").expect("valid pattern"));
static ALTER_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\balter\s+table\b").expect("valid pattern"));
static BEGIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bbegin\b").expect("valid pattern"));
static COMMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bcommit\b").expect("valid pattern"));

/// Kind of advisory finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintKind {
    /// Upsert against a table created in the same file; the conflict target may lack a unique constraint
    UpsertWithoutConstraint,
    /// Schema changes without an explicit transaction wrapper
    DdlOutsideTransaction,
    /// Will be executed statement by statement without a transaction
    NonTransactional,
    /// Explicit `BEGIN`/`COMMIT` in a file the runner already wraps in a transaction
    EmbeddedTransactionControl,
}

/// One advisory finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintIssue {
    pub kind: LintKind,
    pub message: String,
}

impl LintIssue {
    fn new(kind: LintKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

/// Inspect migration text without logging
pub fn check(sql: &str) -> Vec<LintIssue> {
    let mut issues = Vec::new();

    if ON_CONFLICT.is_match(sql) && CREATE_IF_NOT_EXISTS.is_match(sql) {
        issues.push(LintIssue::new(
            LintKind::UpsertWithoutConstraint,
            "ON CONFLICT used with CREATE TABLE IF NOT EXISTS; the conflict target may have no unique constraint",
        ));
    }

    if ALTER_TABLE.is_match(sql) && !BEGIN.is_match(sql) && !COMMIT.is_match(sql) {
        issues.push(LintIssue::new(
            LintKind::DdlOutsideTransaction,
            "ALTER TABLE without an explicit BEGIN/COMMIT",
        ));
    }

    if is_concurrent_index(sql) {
        issues.push(LintIssue::new(
            LintKind::NonTransactional,
            "Concurrent index directive; statements run without a transaction",
        ));
    } else if has_transaction_control(sql) {
        issues.push(LintIssue::new(
            LintKind::EmbeddedTransactionControl,
            "Explicit transaction statements inside a transactional migration; a COMMIT ends the runner's \
             transaction early and later failures are no longer rolled back",
        ));
    }

    issues
}

/// Inspect migration text and log each finding
pub fn lint_migration(filename: &str, sql: &str) -> Vec<LintIssue> {
    let issues = check(sql);
    for issue in &issues {
        match issue.kind {
            LintKind::NonTransactional => tracing::info!("{}: {}", filename, issue.message),
            _ => tracing::warn!("Potential issue in {}: {}", filename, issue.message),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<LintKind> {
        check(sql).into_iter().map(|i| i.kind).collect()
    }

    #[test]
    fn test_clean_migration_has_no_issues() {
        assert!(kinds("CREATE TABLE ships (id SERIAL PRIMARY KEY, name TEXT NOT NULL);").is_empty());
    }

    #[test]
    fn test_upsert_with_create_if_not_exists() {
        let sql = "CREATE TABLE IF NOT EXISTS settings (key TEXT, value TEXT);\n\
                   INSERT INTO settings VALUES ('a', 'b') ON CONFLICT (key) DO NOTHING;";
        assert_eq!(kinds(sql), vec![LintKind::UpsertWithoutConstraint]);
    }

    #[test]
    fn test_alter_table_wrapping() {
        assert_eq!(
            kinds("ALTER TABLE loot ADD COLUMN sold BOOLEAN;"),
            vec![LintKind::DdlOutsideTransaction]
        );
        assert!(!kinds("BEGIN;\nALTER TABLE loot ADD COLUMN sold BOOLEAN;\nCOMMIT;")
            .contains(&LintKind::DdlOutsideTransaction));
    }

    #[test]
    fn test_embedded_commit_in_transactional_file() {
        assert_eq!(
            kinds("BEGIN;\nALTER TABLE loot ADD COLUMN sold BOOLEAN;\nCOMMIT;"),
            vec![LintKind::EmbeddedTransactionControl]
        );
        assert_eq!(
            kinds("CREATE TABLE a (id int);\nCOMMIT;\nCREATE TABLE b (id int);"),
            vec![LintKind::EmbeddedTransactionControl]
        );
        // Concurrent files have their markers stripped before execution
        assert_eq!(
            kinds("BEGIN;\nCREATE INDEX CONCURRENTLY idx ON a(id);\nCOMMIT;"),
            vec![LintKind::NonTransactional]
        );
    }

    #[test]
    fn test_concurrent_index_is_informational() {
        let issues = lint_migration("004_idx.sql", "CREATE INDEX CONCURRENTLY idx_foo ON bar(baz);");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, LintKind::NonTransactional);
    }
}
