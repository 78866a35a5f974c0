//! Migration Catalog - File system side of the migration system
//!
//! Lists, reads and fingerprints the `.sql` files of the migrations directory
//! and scaffolds new ones. Execution order is the byte-wise sort order of the
//! file names.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::definitions::MigrationSource;
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

const MIN_SEQUENCE_WIDTH: usize = 3;

/// SHA-256 of migration contents, lowercase hex
pub fn checksum(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a directory entry name is a migration file
pub fn is_migration_file(name: &str) -> bool {
    name.ends_with(".sql") && !name.contains("rollback")
}

/// Read-mostly view of the migrations directory
#[derive(Debug, Clone)]
pub struct MigrationCatalog {
    dir: PathBuf,
}

impl MigrationCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.migrations_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Migration filenames in execution order.
    ///
    /// A missing directory is a fresh environment, not an error.
    pub fn list_available(&self) -> MigrationResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("Migrations directory does not exist: {}", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(MigrationError::Io(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_migration_file(name) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Is `filename` part of the catalog?
    pub fn contains(&self, filename: &str) -> MigrationResult<bool> {
        Ok(self.list_available()?.iter().any(|f| f == filename))
    }

    /// Full text of a migration
    pub fn read_migration(&self, filename: &str) -> MigrationResult<String> {
        let path = self.path_of(filename)?;
        Ok(fs::read_to_string(path)?)
    }

    /// Text, checksum and size of a migration
    pub fn read_and_checksum(&self, filename: &str) -> MigrationResult<MigrationSource> {
        let contents = self.read_migration(filename)?;
        Ok(MigrationSource {
            filename: filename.to_string(),
            checksum: checksum(&contents),
            size_bytes: contents.len() as u64,
            contents,
        })
    }

    /// Scaffold the next migration file and return its filename.
    ///
    /// The sequence number is one past the highest numeric prefix in the
    /// directory, zero-padded to the widest existing prefix.
    pub fn create_migration(&self, name: &str) -> MigrationResult<String> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrationError::validation(
                "Migration name must contain at least one letter or digit",
            ));
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| MigrationError::SetupFailure(format!("Failed to create migrations directory: {}", e)))?;

        let (next, width) = next_sequence(&self.list_available()?);
        let filename = format!("{:0width$}_{}.sql", next, slug, width = width);
        let path = self.dir.join(&filename);
        if path.exists() {
            return Err(MigrationError::validation(format!("Migration {} already exists", filename)));
        }

        let template = format!(
            "-- Migration: {}\n\
             -- Created: {}\n\
             --\n\
             -- Runs inside a transaction unless the file builds an index CONCURRENTLY,\n\
             -- in which case every statement runs on its own.\n\n",
            name.trim(),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        fs::write(&path, template)?;

        tracing::info!("Created migration: {}", path.display());
        Ok(filename)
    }

    fn path_of(&self, filename: &str) -> MigrationResult<PathBuf> {
        let plain = !filename.is_empty()
            && !filename.contains(['/', '\\'])
            && filename != "."
            && filename != ".."
            && Path::new(filename).file_name().and_then(|n| n.to_str()) == Some(filename);
        if !plain {
            return Err(MigrationError::validation(format!("Invalid migration filename: {}", filename)));
        }
        Ok(self.dir.join(filename))
    }
}

fn slugify(name: &str) -> String {
    let lowered: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    lowered
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn next_sequence(files: &[String]) -> (u64, usize) {
    let mut highest = 0;
    let mut width = MIN_SEQUENCE_WIDTH;
    for file in files {
        let digits: String = file.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            continue;
        }
        width = width.max(digits.len());
        if let Ok(value) = digits.parse::<u64>() {
            highest = highest.max(value);
        }
    }
    (highest + 1, width)
}
