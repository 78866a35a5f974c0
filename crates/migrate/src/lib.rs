//! # pathfinder-migrate: Schema migrations for the Pathfinder campaign tracker
//!
//! Applies a linear, lexicographically ordered directory of `.sql` files to
//! PostgreSQL and tracks what has been applied in a single table. Migrations
//! that build indexes `CONCURRENTLY` run statement by statement outside a
//! transaction; everything else runs in one transaction together with its
//! tracking record.
//!
//! The entry point is [`Migrator`]; [`MigrationAdmin`] wraps it with the
//! request and response shapes used by operator tooling.

pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;

pub use backends::{MigrationBackend, MigrationConnection, PostgresBackend, TrackingTables};
#[cfg(any(test, feature = "testing"))]
pub use backends::MemoryBackend;
pub use config::{ConfigError, DatabaseConfig, MigrationConfig};
pub use error::{DatabaseError, MigrationError, MigrationResult};
pub use migrations::*;
