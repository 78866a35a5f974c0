//! PostgreSQL Backend Implementation
//!
//! Implements the migration backend traits with sqlx. Migration bodies are
//! sent through the simple query protocol so a file may contain several
//! statements; tracking-table operations use bound parameters.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgDatabaseError, PgErrorPosition, PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row};

use super::core::*;
use super::DatabaseBackendType;
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DbResult, MigrationError, MigrationResult};
use crate::migrations::definitions::{
    HistoryAction, HistoryEntry, HistoryOutcome, HistoryStatus, MigrationRecord, NewHistoryEntry,
    NewMigrationRecord, SYSTEM_VERSION, SYSTEM_VERSION_KEY,
};

/// PostgreSQL migration backend
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    description: String,
}

impl PostgresBackend {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            description: "postgresql".to_string(),
        }
    }

    /// Create a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> MigrationResult<Self> {
        config.validate()?;
        tracing::debug!(
            "Creating database pool: max={}, min={}, timeout={}s",
            config.max_connections,
            config.min_connections,
            config.acquire_timeout
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create database pool: {}", e);
                MigrationError::Connection(format!("Failed to connect to {}: {}", config.redacted_url(), e))
            })?;

        tracing::info!("Database pool created for {}", config.redacted_url());
        Ok(Self {
            pool,
            description: config.redacted_url(),
        })
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    async fn acquire(&self) -> MigrationResult<Box<dyn MigrationConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to acquire connection: {}", e)))?;
        Ok(Box::new(PostgresConnection { conn }))
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl MigrationConnection for PostgresConnection {
    async fn begin(&mut self) -> DbResult<()> {
        (&mut *self.conn).execute("BEGIN").await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        (&mut *self.conn).execute("COMMIT").await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        (&mut *self.conn).execute("ROLLBACK").await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        (&mut *self.conn).execute(sql).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn ensure_tracking_tables(&mut self, tables: &TrackingTables) -> DbResult<()> {
        let sql = create_tracking_tables_sql(tables);
        (&mut *self.conn).execute(sql.as_str()).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn insert_record(&mut self, tables: &TrackingTables, record: &NewMigrationRecord) -> DbResult<()> {
        sqlx::query(&insert_record_sql(tables))
            .bind(&record.filename)
            .bind(&record.migration_id)
            .bind(&record.applied_by)
            .bind(&record.notes)
            .bind(record.is_manual_marking)
            .bind(&record.checksum)
            .bind(record.execution_time_ms)
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fetch_records(&mut self, tables: &TrackingTables) -> DbResult<Vec<MigrationRecord>> {
        let rows = sqlx::query(&select_records_sql(tables))
            .fetch_all(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert_history(&mut self, tables: &TrackingTables, entry: &NewHistoryEntry) -> DbResult<i64> {
        let row = sqlx::query(&insert_history_sql(tables))
            .bind(&entry.migration_id)
            .bind(&entry.filename)
            .bind(entry.action.as_str())
            .bind(entry.status.as_str())
            .bind(&entry.applied_by)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn complete_history(
        &mut self,
        tables: &TrackingTables,
        id: i64,
        outcome: &HistoryOutcome,
    ) -> DbResult<()> {
        sqlx::query(&complete_history_sql(tables))
            .bind(id)
            .bind(outcome.status.as_str())
            .bind(outcome.execution_time_ms)
            .bind(&outcome.error_message)
            .bind(&outcome.error_detail)
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fetch_history(&mut self, tables: &TrackingTables, filter: Option<&str>) -> DbResult<Vec<HistoryEntry>> {
        let rows = match filter {
            Some(filter) => sqlx::query(&select_history_sql(tables, true))
                .bind(filter)
                .fetch_all(&mut *self.conn)
                .await,
            None => sqlx::query(&select_history_sql(tables, false))
                .fetch_all(&mut *self.conn)
                .await,
        }
        .map_err(map_sqlx_error)?;
        rows.iter().map(history_from_row).collect()
    }

    async fn fetch_config(&mut self, tables: &TrackingTables) -> DbResult<BTreeMap<String, String>> {
        let rows = sqlx::query(&format!("SELECT key, value FROM {}", tables.config))
            .fetch_all(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;

        let mut config = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key").map_err(map_sqlx_error)?;
            let value: String = row.try_get("value").map_err(map_sqlx_error)?;
            config.insert(key, value);
        }
        Ok(config)
    }

    async fn clear_tracking(&mut self, tables: &TrackingTables) -> DbResult<u64> {
        let removed = sqlx::query(&format!("DELETE FROM {}", tables.migrations))
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        sqlx::query(&format!("DELETE FROM {} WHERE key <> $1", tables.config))
            .bind(SYSTEM_VERSION_KEY)
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(removed)
    }
}

/// Capture SQLSTATE, detail, hint and position from a sqlx error
pub fn map_sqlx_error(err: sqlx::Error) -> DatabaseError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let mut mapped = DatabaseError::new(db_err.message());
            if let Some(code) = db_err.code() {
                mapped = mapped.with_code(code.into_owned());
            }
            if let Some(pg_err) = db_err.try_downcast_ref::<PgDatabaseError>() {
                if let Some(detail) = pg_err.detail() {
                    mapped = mapped.with_detail(detail);
                }
                if let Some(hint) = pg_err.hint() {
                    mapped = mapped.with_hint(hint);
                }
                if let Some(PgErrorPosition::Original(position)) = pg_err.position() {
                    mapped = mapped.with_position(position);
                }
            }
            mapped
        }
        _ => DatabaseError::new(err.to_string()),
    }
}

fn record_from_row(row: &PgRow) -> DbResult<MigrationRecord> {
    Ok(MigrationRecord {
        filename: row.try_get("filename").map_err(map_sqlx_error)?,
        migration_id: row.try_get("migration_id").map_err(map_sqlx_error)?,
        applied_at: row.try_get("applied_at").map_err(map_sqlx_error)?,
        applied_by: row.try_get("applied_by").map_err(map_sqlx_error)?,
        notes: row.try_get("notes").map_err(map_sqlx_error)?,
        is_manual_marking: row.try_get("is_manual_marking").map_err(map_sqlx_error)?,
        checksum: row.try_get("checksum").map_err(map_sqlx_error)?,
        execution_time_ms: row.try_get("execution_time_ms").map_err(map_sqlx_error)?,
    })
}

fn history_from_row(row: &PgRow) -> DbResult<HistoryEntry> {
    let action: String = row.try_get("action").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(HistoryEntry {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        migration_id: row.try_get("migration_id").map_err(map_sqlx_error)?,
        filename: row.try_get("filename").map_err(map_sqlx_error)?,
        action: HistoryAction::parse(&action)
            .ok_or_else(|| DatabaseError::new(format!("Unknown history action '{}'", action)))?,
        status: HistoryStatus::parse(&status)
            .ok_or_else(|| DatabaseError::new(format!("Unknown history status '{}'", status)))?,
        started_at: row.try_get("started_at").map_err(map_sqlx_error)?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx_error)?,
        execution_time_ms: row.try_get("execution_time_ms").map_err(map_sqlx_error)?,
        error_message: row.try_get("error_message").map_err(map_sqlx_error)?,
        error_detail: row.try_get("error_detail").map_err(map_sqlx_error)?,
        applied_by: row.try_get("applied_by").map_err(map_sqlx_error)?,
    })
}

/// SQL to create the tracking, history and config tables
pub fn create_tracking_tables_sql(tables: &TrackingTables) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {migrations} (\n    \
            filename VARCHAR(255) PRIMARY KEY,\n    \
            migration_id VARCHAR(255) NOT NULL,\n    \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,\n    \
            applied_by VARCHAR(255),\n    \
            notes TEXT,\n    \
            is_manual_marking BOOLEAN NOT NULL DEFAULT FALSE,\n    \
            checksum VARCHAR(64),\n    \
            execution_time_ms BIGINT\n\
        );\n\
        CREATE TABLE IF NOT EXISTS {history} (\n    \
            id BIGSERIAL PRIMARY KEY,\n    \
            migration_id VARCHAR(255) NOT NULL,\n    \
            filename VARCHAR(255) NOT NULL,\n    \
            action VARCHAR(32) NOT NULL,\n    \
            status VARCHAR(32) NOT NULL,\n    \
            started_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,\n    \
            completed_at TIMESTAMPTZ,\n    \
            execution_time_ms BIGINT,\n    \
            error_message TEXT,\n    \
            error_detail TEXT,\n    \
            applied_by VARCHAR(255)\n\
        );\n\
        CREATE TABLE IF NOT EXISTS {config} (\n    \
            key VARCHAR(255) PRIMARY KEY,\n    \
            value TEXT NOT NULL,\n    \
            updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
        );\n\
        INSERT INTO {config} (key, value) VALUES ('{version_key}', '{version}') ON CONFLICT (key) DO NOTHING;",
        migrations = tables.migrations,
        history = tables.history,
        config = tables.config,
        version_key = SYSTEM_VERSION_KEY,
        version = SYSTEM_VERSION,
    )
}

/// SQL to record a migration as applied
pub fn insert_record_sql(tables: &TrackingTables) -> String {
    format!(
        "INSERT INTO {} (filename, migration_id, applied_by, notes, is_manual_marking, checksum, execution_time_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        tables.migrations
    )
}

/// SQL to get applied migrations, oldest first
pub fn select_records_sql(tables: &TrackingTables) -> String {
    format!(
        "SELECT filename, migration_id, applied_at, applied_by, notes, is_manual_marking, checksum, execution_time_ms \
         FROM {} ORDER BY applied_at ASC, filename ASC",
        tables.migrations
    )
}

/// SQL to open an audit row
pub fn insert_history_sql(tables: &TrackingTables) -> String {
    format!(
        "INSERT INTO {} (migration_id, filename, action, status, applied_by) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
        tables.history
    )
}

/// SQL to complete an audit row
pub fn complete_history_sql(tables: &TrackingTables) -> String {
    format!(
        "UPDATE {} SET status = $2, completed_at = CURRENT_TIMESTAMP, execution_time_ms = $3, \
         error_message = $4, error_detail = $5 WHERE id = $1",
        tables.history
    )
}

/// SQL to read audit rows, newest first
pub fn select_history_sql(tables: &TrackingTables, filtered: bool) -> String {
    let filter = if filtered {
        " WHERE filename = $1 OR migration_id = $1"
    } else {
        ""
    };
    format!(
        "SELECT id, migration_id, filename, action, status, started_at, completed_at, execution_time_ms, \
         error_message, error_detail, applied_by FROM {}{} ORDER BY started_at DESC, id DESC",
        tables.history, filter
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tracking_tables_sql_is_idempotent_ddl() {
        let sql = create_tracking_tables_sql(&TrackingTables::default());
        assert_eq!(sql.matches("CREATE TABLE IF NOT EXISTS").count(), 3);
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS schema_migrations"));
        assert!(sql.contains("filename VARCHAR(255) PRIMARY KEY"));
        assert!(sql.contains("is_manual_marking BOOLEAN NOT NULL DEFAULT FALSE"));
        assert!(sql.contains("ON CONFLICT (key) DO NOTHING"));
        assert!(sql.contains("'migration_system_version', '2.0'"));
    }

    #[test]
    fn test_custom_table_names_flow_into_sql() {
        let tables = TrackingTables {
            migrations: "ops.applied".to_string(),
            history: "ops.attempts".to_string(),
            config: "ops.settings".to_string(),
        };
        assert!(insert_record_sql(&tables).starts_with("INSERT INTO ops.applied "));
        assert!(select_records_sql(&tables).contains("FROM ops.applied ORDER BY applied_at ASC"));
        assert!(insert_history_sql(&tables).contains("RETURNING id"));
        assert!(complete_history_sql(&tables).starts_with("UPDATE ops.attempts"));
    }

    #[test]
    fn test_history_filter_matches_filename_or_id() {
        let tables = TrackingTables::default();
        let filtered = select_history_sql(&tables, true);
        assert!(filtered.contains("WHERE filename = $1 OR migration_id = $1"));
        assert!(filtered.ends_with("ORDER BY started_at DESC, id DESC"));
        assert!(!select_history_sql(&tables, false).contains("WHERE"));
    }

    #[test]
    fn test_non_database_errors_keep_message() {
        let mapped = map_sqlx_error(sqlx::Error::RowNotFound);
        assert!(mapped.code.is_none());
        assert!(!mapped.message.is_empty());
    }
}
