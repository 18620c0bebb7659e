//! # yoyo-core
//!
//! Shared foundation for the yoyo migration engine: the [`Error`] type used
//! across every crate, the [`MigrationConfig`] carried into the executor, the
//! [`CancellationToken`] callers use to interrupt a run, and the
//! [`DatabaseUri`] parser for connection strings.

pub mod config;
pub mod error;
pub mod uri;

pub use config::{CancellationToken, ConfirmFn, Decision, MigrationConfig};
pub use error::{Error, Result};
pub use uri::DatabaseUri;

/// Default name of the table recording applied migrations.
pub const DEFAULT_MIGRATION_TABLE: &str = "_yoyo_migration";

/// Default name of the table backing the cross-process lock.
pub const DEFAULT_LOCK_TABLE: &str = "_yoyo_lock";

/// Which way a migration is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Applying the migration.
    Forward,
    /// Rolling the migration back.
    Backward,
}

impl Direction {
    /// The verb form used in log and error messages.
    pub fn verb(self) -> &'static str {
        match self {
            Self::Forward => "applying",
            Self::Backward => "rolling back",
        }
    }
}
