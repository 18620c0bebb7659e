//! # yoyo-backends
//!
//! Backend adapters for the yoyo migration engine. Each supported database
//! engine implements the [`MigrationBackend`] trait, giving the executor a
//! uniform surface for statement execution, the two-level transaction
//! protocol (outer transaction + savepoints), the applied-set table, and the
//! cross-process advisory lock.
//!
//! Supported backends, each behind a cargo feature:
//! - `sqlite` — [`SqliteBackend`] via `rusqlite`
//! - `postgres` — [`PostgresBackend`] via `tokio-postgres`
//! - `mysql` — [`MySqlBackend`] via `mysql_async`
//!
//! [`connect`] picks a backend from a database URI through the process-wide
//! registry.

pub mod base;
pub mod registry;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgresql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::{AppliedMigration, MigrationBackend, SqlValue};
pub use registry::{connect, register_backend, reset_registry};

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;
#[cfg(feature = "postgres")]
pub use postgresql::PostgresBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
