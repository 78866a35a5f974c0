//! Core Migration Backend Traits
//!
//! The migration components talk to the database only through these traits.
//! A connection exposes explicit transaction control, raw script execution for
//! migration bodies, and typed operations on the tracking tables.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::MigrationConfig;
use crate::error::{DbResult, MigrationResult};
use crate::migrations::definitions::{
    HistoryEntry, HistoryOutcome, MigrationRecord, NewHistoryEntry, NewMigrationRecord,
};

use super::DatabaseBackendType;

/// Names of the tables owned by the migration system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingTables {
    pub migrations: String,
    pub history: String,
    pub config: String,
}

impl TrackingTables {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            migrations: config.migrations_table.clone(),
            history: config.history_table.clone(),
            config: config.config_table.clone(),
        }
    }
}

impl Default for TrackingTables {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

/// Source of connections for the migration system
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Acquire a dedicated connection; it is released when dropped
    async fn acquire(&self) -> MigrationResult<Box<dyn MigrationConnection>>;

    /// Backend kind, for diagnostics
    fn backend_type(&self) -> DatabaseBackendType;

    /// Human-readable target (credentials redacted)
    fn description(&self) -> String;

    /// Close the underlying pool
    async fn close(&self);
}

/// A single database session
#[async_trait]
pub trait MigrationConnection: Send {
    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Execute SQL text that may contain several statements
    async fn execute_batch(&mut self, sql: &str) -> DbResult<()>;

    /// Create the tracking, history and config tables if absent and seed the system version
    async fn ensure_tracking_tables(&mut self, tables: &TrackingTables) -> DbResult<()>;

    /// Insert a migration record; a duplicate filename is a unique violation
    async fn insert_record(&mut self, tables: &TrackingTables, record: &NewMigrationRecord) -> DbResult<()>;

    /// All records ordered by `applied_at`, then filename
    async fn fetch_records(&mut self, tables: &TrackingTables) -> DbResult<Vec<MigrationRecord>>;

    /// Insert an audit row and return its id
    async fn insert_history(&mut self, tables: &TrackingTables, entry: &NewHistoryEntry) -> DbResult<i64>;

    /// Complete a `running` audit row
    async fn complete_history(
        &mut self,
        tables: &TrackingTables,
        id: i64,
        outcome: &HistoryOutcome,
    ) -> DbResult<()>;

    /// Audit rows newest first, optionally restricted to a filename or migration id
    async fn fetch_history(&mut self, tables: &TrackingTables, filter: Option<&str>) -> DbResult<Vec<HistoryEntry>>;

    /// Contents of the config table
    async fn fetch_config(&mut self, tables: &TrackingTables) -> DbResult<BTreeMap<String, String>>;

    /// Delete every record and every config row except the system version.
    /// Returns the number of records removed.
    async fn clear_tracking(&mut self, tables: &TrackingTables) -> DbResult<u64>;
}
