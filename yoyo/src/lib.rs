//! # yoyo
//!
//! Dependency-ordered database schema migrations for PostgreSQL, MySQL, and
//! SQLite.
//!
//! This is the meta-crate re-exporting the engine for convenient access.
//! Pick at least one backend feature (`sqlite`, `postgres`, `mysql`), point
//! [`read_migrations`] at your script directories, and drive the façade:
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # async fn demo() -> yoyo::Result<()> {
//! use std::path::PathBuf;
//!
//! let config = yoyo::MigrationConfig::default();
//! let set = yoyo::read_migrations(&[PathBuf::from("migrations")])?;
//! let backend = yoyo::get_backend("sqlite:///app.db", &config).await?;
//! yoyo::apply_migrations(backend.as_ref(), &set, None, false, &config).await?;
//! # Ok(())
//! # }
//! ```

/// Core types: errors, configuration, cancellation, URI parsing.
pub use yoyo_core as core;

/// Backend adapters for the supported database engines.
pub use yoyo_backends as backends;

/// The migration engine: object model, graph, plans, executor, sources.
pub use yoyo_migrations as migrations;

pub use yoyo_core::{
    CancellationToken, ConfirmFn, DatabaseUri, Decision, Direction, Error, MigrationConfig, Result,
};

pub use yoyo_backends::{AppliedMigration, MigrationBackend, SqlValue};

pub use yoyo_migrations::{
    apply_migrations, apply_migrations_only, get_backend, mark_migrations, read_migrations,
    reapply_migrations, rollback_migrations, rollback_one, unmark_migrations, DependencyGraph,
    ExecutionReport, Executor, IgnoreErrors, Migration, MigrationSet, Operation, Plan, Step,
};
