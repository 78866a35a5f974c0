//! Migration System
//!
//! Catalog (files) → Store (tracking tables) → Executor (one file) →
//! Orchestrator (pending set, run loop, repair tools) → Admin (operator API).

pub mod admin;
pub mod catalog;
pub mod definitions;
pub mod executor;
pub mod lint;
pub mod orchestrator;
pub mod rollback;
pub mod splitter;
pub mod store;

pub use admin::*;
pub use catalog::MigrationCatalog;
pub use definitions::*;
pub use executor::{strategy_for, MigrationExecutor};
pub use lint::{LintIssue, LintKind};
pub use orchestrator::Migrator;
pub use rollback::RollbackTemplates;
pub use store::MigrationStore;
