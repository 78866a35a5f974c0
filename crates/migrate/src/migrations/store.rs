//! Migration Store - Tracking, audit and config tables
//!
//! Reads are forgiving: a missing or unreadable tracking table yields an empty
//! result and a warning, so status pages work on a fresh database. Writes that
//! decide what has been applied propagate every failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backends::{MigrationBackend, MigrationConnection, TrackingTables};
use crate::error::{MigrationError, MigrationResult};
use super::definitions::{
    HistoryEntry, HistoryOutcome, MigrationRecord, NewHistoryEntry, NewMigrationRecord,
};

/// Access to the tables owned by the migration system
#[derive(Clone)]
pub struct MigrationStore {
    backend: Arc<dyn MigrationBackend>,
    tables: TrackingTables,
}

impl MigrationStore {
    pub fn new(backend: Arc<dyn MigrationBackend>, tables: TrackingTables) -> Self {
        Self { backend, tables }
    }

    pub fn tables(&self) -> &TrackingTables {
        &self.tables
    }

    pub fn backend(&self) -> &Arc<dyn MigrationBackend> {
        &self.backend
    }

    /// Create the tracking tables if needed. Safe to call repeatedly.
    pub async fn ensure_table(&self) -> MigrationResult<()> {
        let mut conn = self
            .backend
            .acquire()
            .await
            .map_err(|e| MigrationError::SetupFailure(e.to_string()))?;
        conn.ensure_tracking_tables(&self.tables).await.map_err(|e| {
            tracing::error!("Failed to create migration tracking tables: {}", e);
            MigrationError::SetupFailure(format!("Failed to create migration tracking tables: {}", e))
        })?;
        tracing::debug!("Migration tracking tables ready: {}", self.tables.migrations);
        Ok(())
    }

    /// Applied filenames, oldest first
    pub async fn list_applied(&self) -> Vec<String> {
        self.applied_records().await.into_iter().map(|r| r.filename).collect()
    }

    /// Applied records, oldest first; empty when the table cannot be read
    pub async fn applied_records(&self) -> Vec<MigrationRecord> {
        match self.try_applied_records().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Could not read applied migrations: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_applied_records(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let mut conn = self.backend.acquire().await?;
        conn.fetch_records(&self.tables)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))
    }

    /// Insert a record on the caller's connection, joining its transaction
    pub async fn record_applied(
        &self,
        conn: &mut dyn MigrationConnection,
        record: &NewMigrationRecord,
    ) -> MigrationResult<()> {
        conn.insert_record(&self.tables, record)
            .await
            .map_err(|e| MigrationError::from_record(&record.filename, e))
    }

    /// Records newest first, optionally limited to a filename or migration id
    pub async fn history(&self, filter: Option<&str>) -> Vec<MigrationRecord> {
        let mut records = self.applied_records().await;
        if let Some(filter) = filter {
            records.retain(|r| r.filename == filter || r.migration_id == filter);
        }
        records.reverse();
        records
    }

    /// Audit rows newest first; empty when the table cannot be read
    pub async fn attempts(&self, filter: Option<&str>) -> Vec<HistoryEntry> {
        let result = match self.backend.acquire().await {
            Ok(mut conn) => conn
                .fetch_history(&self.tables, filter)
                .await
                .map_err(|e| MigrationError::Connection(e.to_string())),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("Could not read migration history: {}", e);
            Vec::new()
        })
    }

    /// Contents of the config table; empty when it cannot be read
    pub async fn config(&self) -> BTreeMap<String, String> {
        let result = match self.backend.acquire().await {
            Ok(mut conn) => conn
                .fetch_config(&self.tables)
                .await
                .map_err(|e| MigrationError::Connection(e.to_string())),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("Could not read migration config: {}", e);
            BTreeMap::new()
        })
    }

    /// Open an audit row; failures are logged and yield `None`
    pub async fn start_attempt(&self, entry: &NewHistoryEntry) -> Option<i64> {
        let result = match self.backend.acquire().await {
            Ok(mut conn) => conn
                .insert_history(&self.tables, entry)
                .await
                .map_err(|e| MigrationError::Connection(e.to_string())),
            Err(e) => Err(e),
        };
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Could not record migration attempt for {}: {}", entry.filename, e);
                None
            }
        }
    }

    /// Close an audit row opened by [`start_attempt`](Self::start_attempt)
    pub async fn finish_attempt(&self, id: Option<i64>, outcome: &HistoryOutcome) {
        let Some(id) = id else { return };
        let result = match self.backend.acquire().await {
            Ok(mut conn) => conn
                .complete_history(&self.tables, id, outcome)
                .await
                .map_err(|e| MigrationError::Connection(e.to_string())),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Could not complete migration history entry {}: {}", id, e);
        }
    }

    /// Delete every record and every config row except the system version.
    ///
    /// Runs in one transaction; returns the number of records removed.
    pub async fn reset(&self) -> MigrationResult<u64> {
        let mut conn = self.backend.acquire().await?;
        conn.begin()
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;

        match conn.clear_tracking(&self.tables).await {
            Ok(removed) => {
                conn.commit()
                    .await
                    .map_err(|e| MigrationError::Connection(e.to_string()))?;
                Ok(removed)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::debug!("Rollback after failed reset also failed: {}", rollback_err);
                }
                Err(MigrationError::Connection(format!("Failed to reset migration tracking: {}", e)))
            }
        }
    }
}
