//! In-process migration backend
//!
//! Models just enough of PostgreSQL for the runner: explicit transactions with
//! rollback, a unique filename constraint, the refusal of concurrent index
//! builds inside a transaction block, and missing tables before
//! `ensure_tracking_tables`. Executed statements are recorded as "effects" so
//! tests can observe what survived a failure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::core::*;
use super::DatabaseBackendType;
use crate::error::{DatabaseError, DbResult, MigrationResult, ACTIVE_SQL_TRANSACTION, UNIQUE_VIOLATION};
use crate::migrations::definitions::{
    HistoryEntry, HistoryOutcome, MigrationRecord, NewHistoryEntry, NewMigrationRecord, SYSTEM_VERSION,
    SYSTEM_VERSION_KEY,
};

const UNDEFINED_TABLE: &str = "42P01";

/// A statement submitted to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub in_transaction: bool,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    records: Vec<MigrationRecord>,
    config: BTreeMap<String, String>,
    effects: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables_created: bool,
    records: Vec<MigrationRecord>,
    history: Vec<HistoryEntry>,
    next_history_id: i64,
    config: BTreeMap<String, String>,
    effects: Vec<String>,
    executed: Vec<ExecutedStatement>,
    failures: Vec<(String, DatabaseError)>,
    fail_setup: bool,
    fail_reads: bool,
    open_connections: usize,
    acquired_total: usize,
}

impl MemoryState {
    fn require_tables(&self, table: &str) -> DbResult<()> {
        if self.tables_created && !self.fail_reads {
            Ok(())
        } else {
            Err(DatabaseError::new(format!("relation \"{}\" does not exist", table)).with_code(UNDEFINED_TABLE))
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            records: self.records.clone(),
            config: self.config.clone(),
            effects: self.effects.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.records = snapshot.records;
        self.config = snapshot.config;
        self.effects = snapshot.effects;
    }
}

/// In-process backend; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Any statement containing `pattern` fails with `error`
    pub fn fail_on(&self, pattern: impl Into<String>, error: DatabaseError) {
        self.lock().failures.push((pattern.into(), error));
    }

    /// Make `ensure_tracking_tables` fail
    pub fn fail_setup(&self, fail: bool) {
        self.lock().fail_setup = fail;
    }

    /// Make every tracking-table access fail as if the tables were dropped after setup
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Pretend the tables already exist and contain these records
    pub fn seed_record(&self, record: MigrationRecord) {
        let mut state = self.lock();
        state.tables_created = true;
        state.config.entry(SYSTEM_VERSION_KEY.to_string()).or_insert_with(|| SYSTEM_VERSION.to_string());
        state.records.push(record);
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.lock().config.insert(key.to_string(), value.to_string());
    }

    pub fn tables_created(&self) -> bool {
        self.lock().tables_created
    }

    /// Committed effects of executed migration statements, in order
    pub fn effects(&self) -> Vec<String> {
        self.lock().effects.clone()
    }

    /// Every statement submitted, including failed ones
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.lock().executed.clone()
    }

    pub fn records(&self) -> Vec<MigrationRecord> {
        self.lock().records.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    pub fn config(&self) -> BTreeMap<String, String> {
        self.lock().config.clone()
    }

    /// Connections currently checked out
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Connections handed out since creation
    pub fn acquired_total(&self) -> usize {
        self.lock().acquired_total
    }
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    async fn acquire(&self) -> MigrationResult<Box<dyn MigrationConnection>> {
        let mut state = self.lock();
        state.open_connections += 1;
        state.acquired_total += 1;
        drop(state);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            transaction: None,
        }))
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::Memory
    }

    fn description(&self) -> String {
        "in-process".to_string()
    }

    async fn close(&self) {}
}

fn lock_state(state: &Arc<Mutex<MemoryState>>) -> MutexGuard<'_, MemoryState> {
    // A panicking test thread must not wedge the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection handed out by [`MemoryBackend`]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    transaction: Option<Snapshot>,
}

impl MemoryConnection {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    fn run_statement(&self, state: &mut MemoryState, statement: &str) -> DbResult<()> {
        let in_transaction = self.transaction.is_some();
        state.executed.push(ExecutedStatement {
            sql: statement.to_string(),
            in_transaction,
        });

        if let Some((_, error)) = state.failures.iter().find(|(pattern, _)| statement.contains(pattern.as_str())) {
            return Err(error.clone());
        }

        let upper = statement.to_uppercase();
        if in_transaction && upper.contains("CONCURRENTLY") {
            return Err(DatabaseError::new(format!(
                "{} cannot run inside a transaction block",
                if upper.contains("DROP INDEX") {
                    "DROP INDEX CONCURRENTLY"
                } else {
                    "CREATE INDEX CONCURRENTLY"
                }
            ))
            .with_code(ACTIVE_SQL_TRANSACTION));
        }

        state.effects.push(statement.to_string());
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.open_connections = state.open_connections.saturating_sub(1);
        // Like a server session: an open transaction dies with the connection.
        if let Some(snapshot) = self.transaction.take() {
            state.restore(snapshot);
        }
    }
}

fn is_transaction_control(statement: &str) -> bool {
    let upper = statement.trim().to_uppercase();
    matches!(upper.as_str(), "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "START TRANSACTION")
}

#[async_trait]
impl MigrationConnection for MemoryConnection {
    async fn begin(&mut self) -> DbResult<()> {
        if self.transaction.is_some() {
            return Err(DatabaseError::new("there is already a transaction in progress").with_code(ACTIVE_SQL_TRANSACTION));
        }
        let snapshot = self.lock().snapshot();
        self.transaction = Some(snapshot);
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.transaction = None;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        match self.transaction.take() {
            Some(snapshot) => {
                self.lock().restore(snapshot);
                Ok(())
            }
            None => Err(DatabaseError::new("there is no transaction in progress").with_code("25P01")),
        }
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        let statements: Vec<String> = sql
            .split(';')
            .map(|s| {
                s.lines()
                    .filter(|line| !line.trim_start().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty() && !is_transaction_control(s))
            .collect();

        let state = Arc::clone(&self.state);
        let mut guard = lock_state(&state);
        for statement in &statements {
            self.run_statement(&mut guard, statement)?;
        }
        Ok(())
    }

    async fn ensure_tracking_tables(&mut self, _tables: &TrackingTables) -> DbResult<()> {
        let mut state = self.lock();
        if state.fail_setup {
            return Err(DatabaseError::new("permission denied for schema public").with_code("42501"));
        }
        state.tables_created = true;
        state
            .config
            .entry(SYSTEM_VERSION_KEY.to_string())
            .or_insert_with(|| SYSTEM_VERSION.to_string());
        Ok(())
    }

    async fn insert_record(&mut self, tables: &TrackingTables, record: &NewMigrationRecord) -> DbResult<()> {
        let mut state = self.lock();
        if !state.tables_created {
            return Err(DatabaseError::new(format!("relation \"{}\" does not exist", tables.migrations))
                .with_code(UNDEFINED_TABLE));
        }
        if state.records.iter().any(|r| r.filename == record.filename) {
            return Err(DatabaseError::new(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                tables.migrations
            ))
            .with_code(UNIQUE_VIOLATION)
            .with_detail(format!("Key (filename)=({}) already exists.", record.filename)));
        }
        state.records.push(record.clone().into_record(Utc::now()));
        Ok(())
    }

    async fn fetch_records(&mut self, tables: &TrackingTables) -> DbResult<Vec<MigrationRecord>> {
        let state = self.lock();
        state.require_tables(&tables.migrations)?;
        let mut records = state.records.clone();
        records.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.filename.cmp(&b.filename)));
        Ok(records)
    }

    async fn insert_history(&mut self, tables: &TrackingTables, entry: &NewHistoryEntry) -> DbResult<i64> {
        let mut state = self.lock();
        state.require_tables(&tables.history)?;
        state.next_history_id += 1;
        let id = state.next_history_id;
        state.history.push(HistoryEntry {
            id,
            migration_id: entry.migration_id.clone(),
            filename: entry.filename.clone(),
            action: entry.action,
            status: entry.status,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
            error_message: None,
            error_detail: None,
            applied_by: entry.applied_by.clone(),
        });
        Ok(id)
    }

    async fn complete_history(
        &mut self,
        tables: &TrackingTables,
        id: i64,
        outcome: &HistoryOutcome,
    ) -> DbResult<()> {
        let mut state = self.lock();
        state.require_tables(&tables.history)?;
        if let Some(entry) = state.history.iter_mut().find(|e| e.id == id) {
            entry.status = outcome.status;
            entry.completed_at = Some(Utc::now());
            entry.execution_time_ms = Some(outcome.execution_time_ms);
            entry.error_message = outcome.error_message.clone();
            entry.error_detail = outcome.error_detail.clone();
        }
        Ok(())
    }

    async fn fetch_history(&mut self, tables: &TrackingTables, filter: Option<&str>) -> DbResult<Vec<HistoryEntry>> {
        let state = self.lock();
        state.require_tables(&tables.history)?;
        let mut entries: Vec<HistoryEntry> = state
            .history
            .iter()
            .filter(|e| filter.map_or(true, |f| e.filename == f || e.migration_id == f))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn fetch_config(&mut self, tables: &TrackingTables) -> DbResult<BTreeMap<String, String>> {
        let state = self.lock();
        state.require_tables(&tables.config)?;
        Ok(state.config.clone())
    }

    async fn clear_tracking(&mut self, tables: &TrackingTables) -> DbResult<u64> {
        let mut state = self.lock();
        state.require_tables(&tables.migrations)?;
        let removed = state.records.len() as u64;
        state.records.clear();
        state.config.retain(|key, _| key == SYSTEM_VERSION_KEY);
        Ok(removed)
    }
}
