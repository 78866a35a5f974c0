//! Rollback Templates - Placeholder files for reversing a migration by hand
//!
//! Nothing here is executed. Before a migration runs, a commented template is
//! written to `<migrations>/rollbacks/<stem>_rollback.sql` for an operator to
//! fill in. Existing templates are never overwritten, and failing to write one
//! never aborts the migration.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::MigrationConfig;

/// Writer for rollback templates
#[derive(Debug, Clone)]
pub struct RollbackTemplates {
    dir: PathBuf,
    migrations_table: String,
}

impl RollbackTemplates {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            dir: config.rollback_dir(),
            migrations_table: config.migrations_table.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Template path for a migration filename
    pub fn path_for(&self, filename: &str) -> PathBuf {
        let stem = filename.strip_suffix(".sql").unwrap_or(filename);
        self.dir.join(format!("{}_rollback.sql", stem))
    }

    /// Write the template if it does not exist yet.
    ///
    /// Returns the path when a new file was written. Errors are logged and
    /// swallowed; a read-only filesystem is expected in containers.
    pub fn ensure(&self, filename: &str) -> Option<PathBuf> {
        match self.try_write(filename) {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!("Could not create rollback template for {}: {}", filename, e);
                tracing::warn!("Continuing without rollback template - this is normal in containerized environments");
                None
            }
        }
    }

    fn try_write(&self, filename: &str) -> io::Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(filename);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };
        file.write_all(self.render(filename).as_bytes())?;

        tracing::info!("Created rollback template: {}", path.display());
        Ok(Some(path))
    }

    fn render(&self, filename: &str) -> String {
        format!(
            "-- Rollback for {filename}\n\
             -- Generated automatically - REVIEW AND MODIFY BEFORE USE\n\
             \n\
             -- Add rollback statements here, for example:\n\
             -- DROP TABLE IF EXISTS table_name;\n\
             -- DROP INDEX IF EXISTS index_name;\n\
             -- DELETE FROM settings WHERE name = 'setting_name';\n\
             \n\
             -- Remove migration record\n\
             -- DELETE FROM {table} WHERE filename = '{filename}';\n",
            filename = filename,
            table = self.migrations_table,
        )
    }
}
