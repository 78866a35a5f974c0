//! Migration Orchestrator - Entry point for running and inspecting migrations
//!
//! A [`Migrator`] owns its backend handle and configuration; there is no
//! process-wide instance. It assumes a single writer per database: nothing
//! here locks, and two concurrent runs are only kept apart by the unique
//! filename in the tracking table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::backends::{MigrationBackend, TrackingTables};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};
use super::catalog::MigrationCatalog;
use super::definitions::{
    migration_id, FileValidation, HistoryAction, HistoryEntry, HistoryOutcome, HistoryStatus, MarkOptions,
    MigrationDetail, MigrationRecord, MigrationState, MigrationStatus, NewHistoryEntry, NewMigrationRecord,
    RunReport, PRODUCTION_DETECTED_KEY, SYSTEM_VERSION_KEY,
};
use super::executor::{elapsed_ms, strategy_for, MigrationExecutor};
use super::lint;
use super::rollback::RollbackTemplates;
use super::store::MigrationStore;

/// Catalog entries without a record, in catalog order
pub fn pending(available: &[String], applied: &[String]) -> Vec<String> {
    let applied: HashSet<&str> = applied.iter().map(String::as_str).collect();
    available
        .iter()
        .filter(|f| !applied.contains(f.as_str()))
        .cloned()
        .collect()
}

/// Runs pending migrations and answers questions about migration state
#[derive(Clone)]
pub struct Migrator {
    config: MigrationConfig,
    catalog: MigrationCatalog,
    store: MigrationStore,
    executor: MigrationExecutor,
    rollbacks: RollbackTemplates,
}

impl Migrator {
    pub fn new(backend: Arc<dyn MigrationBackend>, config: MigrationConfig) -> Self {
        let store = MigrationStore::new(backend, TrackingTables::from_config(&config));
        let executor = MigrationExecutor::new(store.clone(), config.applied_by.clone());
        Self {
            catalog: MigrationCatalog::from_config(&config),
            rollbacks: RollbackTemplates::new(&config),
            store,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn MigrationBackend> {
        self.store.backend()
    }

    /// Create the tracking tables
    pub async fn init(&self) -> MigrationResult<()> {
        self.store.ensure_table().await
    }

    /// Apply every pending migration in order, stopping at the first failure
    pub async fn run(&self) -> MigrationResult<RunReport> {
        let start = Instant::now();
        tracing::info!("Starting migration run from {}", self.catalog.dir().display());

        match self.run_pending(start).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.log_recovery_guidance(&e);
                Err(e)
            }
        }
    }

    async fn run_pending(&self, start: Instant) -> MigrationResult<RunReport> {
        self.store.ensure_table().await?;

        let available = self.catalog.list_available()?;
        let applied = self.store.list_applied().await;
        let pending = pending(&available, &applied);
        let skipped_count = available.len() - pending.len();

        tracing::info!(
            "Migration status: {} available, {} applied, {} pending",
            available.len(),
            applied.len(),
            pending.len()
        );

        let mut report = RunReport {
            applied: Vec::new(),
            skipped_count,
            execution_time_ms: 0,
        };

        if pending.is_empty() {
            tracing::info!("No pending migrations");
            report.execution_time_ms = elapsed_ms(start);
            return Ok(report);
        }

        tracing::info!("Found {} pending migrations: {:?}", pending.len(), pending);

        for filename in &pending {
            self.rollbacks.ensure(filename);
            let source = self.catalog.read_and_checksum(filename)?;
            let applied = self.executor.apply(&source).await?;
            report.applied.push(applied);
        }

        report.execution_time_ms = elapsed_ms(start);
        tracing::info!(
            "All migrations applied successfully: {} applied in {}ms",
            report.applied_count(),
            report.execution_time_ms
        );
        Ok(report)
    }

    fn log_recovery_guidance(&self, error: &MigrationError) {
        tracing::error!(detail = error.detail(), hint = error.hint(), "Migration failed: {}", error);
        tracing::error!("Recovery suggestions:");
        tracing::error!("1. Check the migration SQL for syntax errors");
        tracing::error!("2. Verify database constraints and table structure");
        tracing::error!("3. Consider manual intervention if migration is partially applied");
        tracing::error!(
            "4. Check generated rollback templates in {}",
            self.rollbacks.dir().display()
        );
    }

    /// Snapshot of catalog and tracking state
    pub async fn status(&self) -> MigrationResult<MigrationStatus> {
        let available = self.catalog.list_available()?;
        let records = self.store.applied_records().await;
        let config = self.store.config().await;

        let applied: Vec<String> = records.iter().map(|r| r.filename.clone()).collect();
        let available_set: HashSet<&str> = available.iter().map(String::as_str).collect();
        let orphaned = applied
            .iter()
            .filter(|f| !available_set.contains(f.as_str()))
            .cloned()
            .collect();

        Ok(MigrationStatus {
            total: available.len(),
            applied_count: records.len(),
            pending: pending(&available, &applied),
            is_production_database: config.get(PRODUCTION_DETECTED_KEY).map(String::as_str) == Some("true"),
            migration_system_version: config
                .get(SYSTEM_VERSION_KEY)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            applied_list: records,
            available_list: available,
            orphaned,
            config,
        })
    }

    /// Lifecycle state of one file
    pub async fn state_of(&self, filename: &str) -> MigrationResult<MigrationState> {
        Ok(self.status().await?.state_of(filename))
    }

    /// Per-file breakdown: catalog files in order, then orphaned records
    pub async fn details(&self) -> MigrationResult<Vec<MigrationDetail>> {
        let status = self.status().await?;
        let by_name: HashMap<&str, &MigrationRecord> =
            status.applied_list.iter().map(|r| (r.filename.as_str(), r)).collect();

        let detail = |filename: &str| {
            let record = by_name.get(filename);
            MigrationDetail {
                id: migration_id(filename),
                filename: filename.to_string(),
                applied: record.is_some(),
                applied_at: record.map(|r| r.applied_at),
                is_manual_marking: record.map_or(false, |r| r.is_manual_marking),
                state: status.state_of(filename),
            }
        };

        Ok(status
            .available_list
            .iter()
            .chain(status.orphaned.iter())
            .map(|f| detail(f.as_str()))
            .collect())
    }

    /// Record a migration as applied without running it.
    ///
    /// For databases migrated out of band. The file must exist in the catalog.
    pub async fn mark_applied(&self, filename: &str, options: &MarkOptions) -> MigrationResult<()> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(MigrationError::validation("Filename is required"));
        }
        if !self.catalog.contains(filename)? {
            return Err(MigrationError::validation(format!(
                "Migration file not found: {}",
                filename
            )));
        }

        self.store.ensure_table().await?;
        let source = self.catalog.read_and_checksum(filename)?;
        let record = NewMigrationRecord::marked(filename, options, Some(source.checksum));

        let attempt = self
            .store
            .start_attempt(&NewHistoryEntry {
                migration_id: record.migration_id.clone(),
                filename: filename.to_string(),
                action: HistoryAction::MarkApplied,
                status: HistoryStatus::Running,
                applied_by: record.applied_by.clone(),
            })
            .await;

        let start = Instant::now();
        let result = match self.backend().acquire().await {
            Ok(mut conn) => self.store.record_applied(conn.as_mut(), &record).await,
            Err(e) => Err(e),
        };
        self.store
            .finish_attempt(attempt, &outcome_of(&result, elapsed_ms(start)))
            .await;

        match &result {
            Ok(()) => tracing::info!(
                "Migration {} marked as applied by {}",
                filename,
                options.applied_by_or_default()
            ),
            Err(e) => tracing::error!("Failed to mark migration {} as applied: {}", filename, e),
        }
        result
    }

    /// Applied records newest first, optionally for one filename or migration id
    pub async fn history(&self, filter: Option<&str>) -> Vec<MigrationRecord> {
        self.store.history(filter).await
    }

    /// Audit trail of apply / mark / reset attempts, newest first
    pub async fn attempts(&self, filter: Option<&str>) -> Vec<HistoryEntry> {
        self.store.attempts(filter).await
    }

    /// Forget every applied migration.
    ///
    /// Refuses to act unless `confirmed`. Afterwards every catalog file is
    /// pending again; re-run or reconcile with [`mark_applied`](Self::mark_applied).
    pub async fn emergency_reset(&self, confirmed: bool) -> MigrationResult<u64> {
        if !confirmed {
            return Err(MigrationError::validation(
                "Emergency reset requires explicit confirmation",
            ));
        }

        tracing::warn!("Emergency reset of migration tracking requested");
        let attempt = self
            .store
            .start_attempt(&NewHistoryEntry {
                migration_id: "*".to_string(),
                filename: "*".to_string(),
                action: HistoryAction::Reset,
                status: HistoryStatus::Running,
                applied_by: Some(self.config.applied_by.clone()),
            })
            .await;

        let start = Instant::now();
        let result = self.store.reset().await;
        self.store
            .finish_attempt(attempt, &outcome_of(&result, elapsed_ms(start)))
            .await;

        if let Ok(removed) = &result {
            tracing::warn!(
                "Emergency reset removed {} migration record(s); re-run migrations or mark them applied",
                removed
            );
        }
        result
    }

    /// Lint, fingerprint and compare every catalog file against its record
    pub async fn validate(&self) -> MigrationResult<Vec<FileValidation>> {
        let available = self.catalog.list_available()?;
        let records: HashMap<String, MigrationRecord> = self
            .store
            .applied_records()
            .await
            .into_iter()
            .map(|r| (r.filename.clone(), r))
            .collect();

        let mut results = Vec::with_capacity(available.len());
        for filename in &available {
            let source = self.catalog.read_and_checksum(filename)?;
            let record = records.get(filename);
            let checksum_matches = record
                .and_then(|r| r.checksum.as_deref())
                .map(|stored| stored == source.checksum);
            if checksum_matches == Some(false) {
                tracing::warn!("Migration {} changed after it was applied", filename);
            }

            results.push(FileValidation {
                filename: filename.clone(),
                migration_id: migration_id(filename),
                strategy: strategy_for(&source.contents),
                issues: lint::check(&source.contents),
                applied: record.is_some(),
                checksum_matches,
                checksum: source.checksum,
                size_bytes: source.size_bytes,
            });
        }
        Ok(results)
    }
}

fn outcome_of<T>(result: &MigrationResult<T>, execution_time_ms: i64) -> HistoryOutcome {
    match result {
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::error::DatabaseError;
    use crate::migrations::catalog::checksum;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        backend: MemoryBackend,
        migrator: Migrator,
    }

    impl Fixture {
        fn write(&self, name: &str, sql: &str) {
            fs::write(self.migrator.config().migrations_dir.join(name), sql).unwrap();
        }
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let temp = TempDir::new().unwrap();
        for (name, sql) in files {
            fs::write(temp.path().join(name), sql).unwrap();
        }
        let backend = MemoryBackend::new();
        let migrator = Migrator::new(Arc::new(backend.clone()), MigrationConfig::with_dir(temp.path()));
        Fixture {
            _temp: temp,
            backend,
            migrator,
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_pending_preserves_catalog_order() {
        let available = strings(&["001_a.sql", "002_b.sql", "003_c.sql"]);
        assert_eq!(pending(&available, &strings(&["001_a.sql"])), strings(&["002_b.sql", "003_c.sql"]));
        assert_eq!(pending(&available, &strings(&["003_c.sql", "001_a.sql"])), strings(&["002_b.sql"]));
        assert!(pending(&available, &available).is_empty());
        assert_eq!(pending(&available, &[]), available);
    }

    #[tokio::test]
    async fn test_status_example_scenario() {
        let f = fixture(&[("001_a.sql", ""), ("002_b.sql", ""), ("003_c.sql", "")]);
        f.backend.seed_record(
            NewMigrationRecord::executed("001_a.sql", "migration_runner", checksum(""), 1).into_record(Utc::now()),
        );

        let status = f.migrator.status().await.unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.applied_count, 1);
        assert_eq!(status.pending, strings(&["002_b.sql", "003_c.sql"]));
        assert!(!status.is_up_to_date());
        assert_eq!(status.migration_system_version, "2.0");
        assert!(!status.is_production_database);
    }

    #[tokio::test]
    async fn test_status_on_fresh_database() {
        let f = fixture(&[("001_a.sql", "")]);
        let status = f.migrator.status().await.unwrap();
        assert_eq!(status.applied_count, 0);
        assert_eq!(status.migration_system_version, "unknown");
        assert_eq!(f.migrator.state_of("001_a.sql").await.unwrap(), MigrationState::Pending);
        assert_eq!(f.migrator.state_of("zzz.sql").await.unwrap(), MigrationState::Unknown);
    }

    #[tokio::test]
    async fn test_run_applies_in_order_and_is_idempotent() {
        let f = fixture(&[
            ("010_c.sql", "CREATE TABLE c (id int);"),
            ("001_a.sql", "CREATE TABLE a (id int);"),
            ("002_b.sql", "CREATE TABLE b (id int);"),
        ]);

        let report = f.migrator.run().await.unwrap();
        assert_eq!(
            report.applied.iter().map(|a| a.filename.as_str()).collect::<Vec<_>>(),
            vec!["001_a.sql", "002_b.sql", "010_c.sql"]
        );
        assert_eq!(report.skipped_count, 0);
        assert_eq!(
            f.backend.effects(),
            strings(&["CREATE TABLE a (id int)", "CREATE TABLE b (id int)", "CREATE TABLE c (id int)"])
        );

        let records_before = f.backend.records();
        let second = f.migrator.run().await.unwrap();
        assert_eq!(second.applied_count(), 0);
        assert_eq!(second.skipped_count, 3);
        assert_eq!(f.backend.records(), records_before);
        assert!(f.migrator.status().await.unwrap().is_up_to_date());
    }

    #[tokio::test]
    async fn test_run_is_fail_fast() {
        let f = fixture(&[
            ("001_a.sql", "CREATE TABLE a (id int);"),
            ("002_b.sql", "CREATE TABLE b (id int);\nCREATE TABLE broken (id int);"),
            ("003_c.sql", "CREATE TABLE c (id int);"),
        ]);
        f.backend.fail_on("broken", DatabaseError::new("syntax error").with_code("42601"));

        assert!(f.migrator.run().await.is_err());

        let status = f.migrator.status().await.unwrap();
        assert_eq!(status.pending, strings(&["002_b.sql", "003_c.sql"]));
        assert_eq!(f.backend.effects(), strings(&["CREATE TABLE a (id int)"]));
        assert!(!f.backend.executed().iter().any(|s| s.sql.contains("TABLE c")));
        assert_eq!(f.backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_run_writes_rollback_templates() {
        let f = fixture(&[("001_a.sql", "CREATE TABLE a (id int);")]);
        f.migrator.run().await.unwrap();

        let template = f.migrator.config().rollback_dir().join("001_a_rollback.sql");
        assert!(template.exists());
        // Templates live in a subdirectory and never enter the catalog.
        assert_eq!(f.migrator.catalog().list_available().unwrap(), strings(&["001_a.sql"]));
    }

    #[tokio::test]
    async fn test_run_setup_failure_aborts() {
        let f = fixture(&[("001_a.sql", "CREATE TABLE a (id int);")]);
        f.backend.fail_setup(true);
        assert!(matches!(f.migrator.run().await, Err(MigrationError::SetupFailure(_))));
        assert!(f.backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_run_with_missing_directory_is_noop() {
        let temp = TempDir::new().unwrap();
        let backend = MemoryBackend::new();
        let migrator = Migrator::new(
            Arc::new(backend.clone()),
            MigrationConfig::with_dir(temp.path().join("missing")),
        );
        let report = migrator.run().await.unwrap();
        assert_eq!(report.applied_count(), 0);
        assert!(backend.tables_created());
    }

    #[tokio::test]
    async fn test_mark_applied_known_file() {
        let f = fixture(&[("005_x.sql", "CREATE TABLE x (id int);")]);
        let options = MarkOptions {
            applied_by: Some("admin_user_alice".to_string()),
            notes: None,
        };

        f.migrator.mark_applied("005_x.sql", &options).await.unwrap();

        let records = f.backend.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_manual_marking);
        assert_eq!(records[0].applied_by.as_deref(), Some("admin_user_alice"));
        assert_eq!(records[0].notes.as_deref(), Some("Manually marked as applied"));
        assert!(f.backend.effects().is_empty());
        assert_eq!(f.migrator.state_of("005_x.sql").await.unwrap(), MigrationState::Marked);
        assert!(f.migrator.status().await.unwrap().is_up_to_date());

        let attempts = f.migrator.attempts(Some("005_x.sql")).await;
        assert_eq!(attempts[0].action, HistoryAction::MarkApplied);
        assert_eq!(attempts[0].status, HistoryStatus::Success);
    }

    #[tokio::test]
    async fn test_mark_applied_rejects_unknown_and_blank() {
        let f = fixture(&[("001_a.sql", "")]);
        for name in ["999_typo.sql", "   "] {
            let err = f.migrator.mark_applied(name, &MarkOptions::default()).await.unwrap_err();
            assert!(matches!(err, MigrationError::Validation(_)));
        }
        assert!(f.backend.records().is_empty());
        assert_eq!(f.backend.acquired_total(), 0);
    }

    #[tokio::test]
    async fn test_mark_applied_twice_is_duplicate() {
        let f = fixture(&[("001_a.sql", "")]);
        f.migrator.mark_applied("001_a.sql", &MarkOptions::default()).await.unwrap();
        let err = f.migrator.mark_applied("001_a.sql", &MarkOptions::default()).await.unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateMigration { .. }));
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_emergency_reset_guard() {
        let f = fixture(&[("001_a.sql", "CREATE TABLE a (id int);")]);
        f.migrator.run().await.unwrap();
        let acquired = f.backend.acquired_total();

        let err = f.migrator.emergency_reset(false).await.unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)));
        assert_eq!(f.backend.records().len(), 1);
        assert_eq!(f.backend.acquired_total(), acquired);

        assert_eq!(f.migrator.emergency_reset(true).await.unwrap(), 1);
        assert!(f.backend.records().is_empty());
        assert_eq!(f.migrator.status().await.unwrap().pending, strings(&["001_a.sql"]));
        assert_eq!(f.migrator.status().await.unwrap().migration_system_version, "2.0");
    }

    #[tokio::test]
    async fn test_orphans_and_details() {
        let f = fixture(&[("001_a.sql", "CREATE TABLE a (id int);"), ("002_b.sql", "")]);
        f.migrator.run().await.unwrap();
        fs::remove_file(f.migrator.config().migrations_dir.join("002_b.sql")).unwrap();
        f.write("003_c.sql", "CREATE TABLE c (id int);");

        let status = f.migrator.status().await.unwrap();
        assert_eq!(status.orphaned, strings(&["002_b.sql"]));
        assert_eq!(status.pending, strings(&["003_c.sql"]));

        let details = f.migrator.details().await.unwrap();
        let names: Vec<_> = details.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(names, vec!["001_a.sql", "003_c.sql", "002_b.sql"]);
        assert_eq!(details[0].id, "001");
        assert!(details[0].applied && details[0].applied_at.is_some());
        assert_eq!(details[1].state, MigrationState::Pending);
        assert_eq!(details[2].state, MigrationState::Applied);
    }

    #[tokio::test]
    async fn test_validate_detects_checksum_drift() {
        let f = fixture(&[
            ("001_a.sql", "CREATE TABLE a (id int);"),
            ("002_idx.sql", "CREATE INDEX CONCURRENTLY idx ON a(id);"),
        ]);
        f.migrator.run().await.unwrap();
        f.write("001_a.sql", "CREATE TABLE a (id bigint);");
        f.write("003_alter.sql", "ALTER TABLE a ADD COLUMN b int;");

        let results = f.migrator.validate().await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].checksum_matches, Some(false));
        assert_eq!(results[1].checksum_matches, Some(true));
        assert_eq!(results[1].issues[0].kind, lint::LintKind::NonTransactional);
        assert!(!results[2].applied);
        assert_eq!(results[2].checksum_matches, None);
        assert_eq!(results[2].issues[0].kind, lint::LintKind::DdlOutsideTransaction);
        assert_eq!(results[2].size_bytes, 31);
    }

    #[tokio::test]
    async fn test_isolated_instances_do_not_share_state() {
        let a = fixture(&[("001_a.sql", "CREATE TABLE a (id int);")]);
        let b = fixture(&[("001_a.sql", "CREATE TABLE a (id int);")]);
        a.migrator.run().await.unwrap();
        assert!(a.migrator.status().await.unwrap().is_up_to_date());
        assert!(!b.migrator.status().await.unwrap().is_up_to_date());
    }
}
