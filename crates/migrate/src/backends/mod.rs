//! Database Backend Abstractions
//!
//! The migration runner targets PostgreSQL through sqlx. An in-process backend
//! is available behind the `testing` feature for exercising the runner without
//! a server.

pub mod core;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;

pub use core::*;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    Memory,
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::Memory => write!(f, "memory"),
        }
    }
}
