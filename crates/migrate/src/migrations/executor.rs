//! Migration Executor - Applies a single migration file
//!
//! Two strategies:
//!
//! * **Transactional** (default): `BEGIN`, the whole file as one batch, the
//!   tracking record, `COMMIT`. Any failure rolls everything back.
//! * **Non-transactional**: chosen when the file builds or drops an index
//!   `CONCURRENTLY`, which PostgreSQL refuses inside a transaction block. The
//!   file is split into statements that run one at a time, then the record is
//!   written in its own transaction. A failing statement stops the migration
//!   with earlier statements left applied and no record written; an operator
//!   has to reconcile by hand.
//!
//! The transactional batch is sent as written. A `COMMIT` inside the file ends
//! the runner's transaction on PostgreSQL, so statements after it and the
//! tracking record are no longer atomic with what came before. The in-memory
//! test backend ignores such markers and cannot show this; the lint reports
//! them as [`LintKind::EmbeddedTransactionControl`](super::lint::LintKind).

use std::sync::Arc;
use std::time::Instant;

use crate::backends::{MigrationBackend, MigrationConnection};
use crate::error::{MigrationError, MigrationResult};
use super::definitions::{
    migration_id, AppliedMigration, ExecutionStrategy, HistoryAction, HistoryOutcome, HistoryStatus,
    MigrationSource, NewHistoryEntry, NewMigrationRecord,
};
use super::lint::lint_migration;
use super::splitter::{is_concurrent_index, split_statements};
use super::store::MigrationStore;

/// Strategy the executor will use for this migration text
pub fn strategy_for(sql: &str) -> ExecutionStrategy {
    if is_concurrent_index(sql) {
        ExecutionStrategy::NonTransactional
    } else {
        ExecutionStrategy::Transactional
    }
}

/// Executes migration files against a backend
#[derive(Clone)]
pub struct MigrationExecutor {
    backend: Arc<dyn MigrationBackend>,
    store: MigrationStore,
    applied_by: String,
}

impl MigrationExecutor {
    pub fn new(store: MigrationStore, applied_by: impl Into<String>) -> Self {
        Self {
            backend: Arc::clone(store.backend()),
            store,
            applied_by: applied_by.into(),
        }
    }

    /// Apply one migration and record it.
    ///
    /// Writes an audit row around the attempt. The connection used for the
    /// migration is released before this returns, on every path.
    pub async fn apply(&self, source: &MigrationSource) -> MigrationResult<AppliedMigration> {
        let filename = source.filename.as_str();
        let strategy = strategy_for(&source.contents);
        lint_migration(filename, &source.contents);

        tracing::info!(
            "Applying migration: {} (ID: {}, {:?})",
            filename,
            migration_id(filename),
            strategy
        );

        let attempt = self
            .store
            .start_attempt(&NewHistoryEntry {
                migration_id: migration_id(filename),
                filename: filename.to_string(),
                action: HistoryAction::Apply,
                status: HistoryStatus::Running,
                applied_by: Some(self.applied_by.clone()),
            })
            .await;

        let start = Instant::now();
        let result = match strategy {
            ExecutionStrategy::Transactional => self.apply_transactional(source, start).await,
            ExecutionStrategy::NonTransactional => self.apply_non_transactional(source, start).await,
        };
        let execution_time_ms = elapsed_ms(start);

        let outcome = match &result {
            Ok(_) => HistoryOutcome {
                status: HistoryStatus::Success,
                execution_time_ms,
                error_message: None,
                error_detail: None,
            },
            Err(e) => HistoryOutcome {
                status: HistoryStatus::Failure,
                execution_time_ms,
                error_message: Some(e.to_string()),
                error_detail: e.detail().map(str::to_string),
            },
        };
        self.store.finish_attempt(attempt, &outcome).await;

        match &result {
            Ok(applied) => tracing::info!(
                "Migration {} applied successfully in {}ms ({} statement(s))",
                filename,
                applied.execution_time_ms,
                applied.statements_executed
            ),
            Err(e) => tracing::error!(
                filename,
                detail = e.detail(),
                hint = e.hint(),
                "Migration failed: {}",
                e
            ),
        }

        result
    }

    async fn apply_transactional(&self, source: &MigrationSource, start: Instant) -> MigrationResult<AppliedMigration> {
        let filename = source.filename.as_str();
        let mut conn = self.backend.acquire().await?;

        conn.begin()
            .await
            .map_err(|e| MigrationError::from_execution(filename, e, None))?;

        match self.execute_and_record(conn.as_mut(), source, start).await {
            Ok(execution_time_ms) => {
                conn.commit()
                    .await
                    .map_err(|e| MigrationError::from_execution(filename, e, None))?;
                Ok(AppliedMigration {
                    filename: filename.to_string(),
                    strategy: ExecutionStrategy::Transactional,
                    statements_executed: 1,
                    execution_time_ms,
                    checksum: source.checksum.clone(),
                })
            }
            Err(e) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::debug!("Rollback failed (might not be in transaction): {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn execute_and_record(
        &self,
        conn: &mut dyn MigrationConnection,
        source: &MigrationSource,
        start: Instant,
    ) -> MigrationResult<i64> {
        conn.execute_batch(&source.contents)
            .await
            .map_err(|e| MigrationError::from_execution(&source.filename, e, None))?;

        let execution_time_ms = elapsed_ms(start);
        let record = NewMigrationRecord::executed(
            &source.filename,
            &self.applied_by,
            source.checksum.clone(),
            execution_time_ms,
        );
        self.store.record_applied(conn, &record).await?;
        Ok(execution_time_ms)
    }

    async fn apply_non_transactional(
        &self,
        source: &MigrationSource,
        start: Instant,
    ) -> MigrationResult<AppliedMigration> {
        let filename = source.filename.as_str();
        let statements = split_statements(&source.contents);
        tracing::info!(
            "Migration {} contains CONCURRENTLY operations, executing {} statement(s) without transaction",
            filename,
            statements.len()
        );

        let mut conn = self.backend.acquire().await?;

        for (index, statement) in statements.iter().enumerate() {
            tracing::debug!("Executing statement {}/{} of {}", index + 1, statements.len(), filename);
            if let Err(e) = conn.execute_batch(statement).await {
                if index > 0 {
                    tracing::error!(
                        "{} of {} statement(s) in {} were applied before the failure; the migration is not recorded",
                        index,
                        statements.len(),
                        filename
                    );
                }
                return Err(MigrationError::from_execution(filename, e, Some(index)));
            }
        }

        let execution_time_ms = elapsed_ms(start);
        let record = NewMigrationRecord::executed(filename, &self.applied_by, source.checksum.clone(), execution_time_ms);

        conn.begin()
            .await
            .map_err(|e| MigrationError::from_execution(filename, e, None))?;
        if let Err(e) = self.store.record_applied(conn.as_mut(), &record).await {
            if let Err(rollback_err) = conn.rollback().await {
                tracing::debug!("Rollback failed (might not be in transaction): {}", rollback_err);
            }
            return Err(e);
        }
        conn.commit()
            .await
            .map_err(|e| MigrationError::from_execution(filename, e, None))?;

        Ok(AppliedMigration {
            filename: filename.to_string(),
            strategy: ExecutionStrategy::NonTransactional,
            statements_executed: statements.len(),
            execution_time_ms,
            checksum: source.checksum.clone(),
        })
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, TrackingTables};
    use crate::error::{DatabaseError, NO_MATCHING_CONSTRAINT, UNIQUE_VIOLATION};
    use crate::migrations::catalog::checksum;

    fn executor() -> (MemoryBackend, MigrationExecutor) {
        let backend = MemoryBackend::new();
        let store = MigrationStore::new(Arc::new(backend.clone()), TrackingTables::default());
        (backend, MigrationExecutor::new(store, "migration_runner"))
    }

    async fn ready() -> (MemoryBackend, MigrationExecutor) {
        let (backend, executor) = executor();
        executor.store.ensure_table().await.unwrap();
        (backend, executor)
    }

    fn source(filename: &str, contents: &str) -> MigrationSource {
        MigrationSource {
            filename: filename.to_string(),
            contents: contents.to_string(),
            checksum: checksum(contents),
            size_bytes: contents.len() as u64,
        }
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(strategy_for("CREATE TABLE a (id int);"), ExecutionStrategy::Transactional);
        assert_eq!(
            strategy_for("create index concurrently idx on a(id);"),
            ExecutionStrategy::NonTransactional
        );
    }

    #[tokio::test]
    async fn test_transactional_success_records_checksum() {
        let (backend, executor) = ready().await;
        let migration = source("001_a.sql", "CREATE TABLE a (id int);\nCREATE TABLE b (id int);");

        let applied = executor.apply(&migration).await.unwrap();
        assert_eq!(applied.strategy, ExecutionStrategy::Transactional);

        let records = backend.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checksum.as_deref(), Some(migration.checksum.as_str()));
        assert_eq!(records[0].applied_by.as_deref(), Some("migration_runner"));
        assert!(!records[0].is_manual_marking);
        assert_eq!(backend.effects().len(), 2);
        assert!(backend.executed().iter().all(|s| s.in_transaction));
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_transactional_failure_leaves_no_effects() {
        let (backend, executor) = ready().await;
        backend.fail_on("CREATE TABLE b", DatabaseError::new("boom").with_code("XX000"));
        let migration = source("001_a.sql", "CREATE TABLE a (id int);\nCREATE TABLE b (id int);");

        let err = executor.apply(&migration).await.unwrap_err();
        assert!(matches!(err, MigrationError::ExecutionFailure(_)));
        assert!(backend.effects().is_empty());
        assert!(backend.records().is_empty());
        assert_eq!(backend.open_connections(), 0);

        let attempts = backend.history();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, HistoryStatus::Failure);
        assert!(attempts[0].error_message.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_non_transactional_partial_application() {
        let (backend, executor) = ready().await;
        backend.fail_on("idx_two", DatabaseError::new("relation \"missing\" does not exist").with_code("42P01"));
        let migration = source(
            "004_idx.sql",
            "CREATE INDEX CONCURRENTLY idx_one ON loot(owner_id);\n\
             CREATE INDEX CONCURRENTLY idx_two ON missing(x);\n\
             CREATE INDEX CONCURRENTLY idx_three ON loot(value);",
        );

        let err = executor.apply(&migration).await.unwrap_err();
        match err {
            MigrationError::ExecutionFailure(failure) => assert_eq!(failure.statement, Some(1)),
            other => panic!("Expected execution failure, got {:?}", other),
        }

        let effects = backend.effects();
        assert_eq!(effects.len(), 1);
        assert!(effects[0].contains("idx_one"));
        assert!(backend.records().is_empty());
        assert!(!backend.executed().iter().any(|s| s.sql.contains("idx_three")));
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_constraint_failure_names_statement() {
        let (backend, executor) = ready().await;
        backend.fail_on(
            "idx_ships_name",
            DatabaseError::new("could not create unique index \"idx_ships_name\"")
                .with_code(UNIQUE_VIOLATION)
                .with_detail("Key (name)=(Wayfarer) is duplicated."),
        );
        let migration = source(
            "007_unique.sql",
            "CREATE UNIQUE INDEX CONCURRENTLY idx_ships_code ON ships(code);\n\
             CREATE UNIQUE INDEX CONCURRENTLY idx_ships_name ON ships(name);",
        );

        let err = executor.apply(&migration).await.unwrap_err();
        assert!(matches!(err, MigrationError::ConstraintViolation { .. }));
        assert_eq!(err.statement(), Some(1));
        assert!(err.to_string().contains("(statement 2)"));
        assert!(!err.hint().unwrap().contains("ON CONFLICT"));
        assert_eq!(backend.effects().len(), 1);
        assert!(backend.records().is_empty());
    }

    #[tokio::test]
    async fn test_single_concurrent_index_runs_untransacted_then_records() {
        let (backend, executor) = ready().await;
        let migration = source("004_idx.sql", "CREATE INDEX CONCURRENTLY idx_foo ON bar(baz);");

        let applied = executor.apply(&migration).await.unwrap();
        assert_eq!(applied.strategy, ExecutionStrategy::NonTransactional);
        assert_eq!(applied.statements_executed, 1);

        let executed = backend.executed();
        assert_eq!(executed.len(), 1);
        assert!(!executed[0].in_transaction);
        assert_eq!(backend.records()[0].filename, "004_idx.sql");
    }

    #[tokio::test]
    async fn test_explicit_transaction_markers_stripped_for_concurrent_index() {
        let (backend, executor) = ready().await;
        let migration = source(
            "005_idx.sql",
            "BEGIN;\nCREATE UNIQUE INDEX CONCURRENTLY idx_u ON ships(name);\nCOMMIT;",
        );

        executor.apply(&migration).await.unwrap();
        let executed = backend.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].sql.starts_with("CREATE UNIQUE INDEX CONCURRENTLY"));
    }

    #[tokio::test]
    async fn test_duplicate_record_rolls_back_transactional_migration() {
        let (backend, executor) = ready().await;
        let migration = source("001_a.sql", "CREATE TABLE a (id int);");
        executor.apply(&migration).await.unwrap();

        let err = executor.apply(&migration).await.unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateMigration { .. }));
        assert_eq!(backend.effects().len(), 1);
        assert_eq!(backend.records().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_constraint_is_classified_with_hint() {
        let (backend, executor) = ready().await;
        backend.fail_on(
            "ON CONFLICT",
            DatabaseError::new("there is no unique or exclusion constraint matching the ON CONFLICT specification")
                .with_code(NO_MATCHING_CONSTRAINT),
        );
        let migration = source(
            "006_seed.sql",
            "INSERT INTO settings (name, value) VALUES ('a', 'b') ON CONFLICT (name) DO NOTHING;",
        );

        let err = executor.apply(&migration).await.unwrap_err();
        assert!(matches!(err, MigrationError::ConstraintViolation { .. }));
        assert!(err.hint().is_some());
    }

    #[tokio::test]
    async fn test_missing_tables_fail_the_record_insert() {
        let (backend, executor) = executor();
        let migration = source("001_a.sql", "CREATE TABLE a (id int);");

        assert!(executor.apply(&migration).await.is_err());
        assert!(backend.effects().is_empty());
        assert_eq!(backend.open_connections(), 0);
    }
}
