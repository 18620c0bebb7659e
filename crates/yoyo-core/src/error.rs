//! Error types for the yoyo migration engine.
//!
//! A single [`Error`] enum is shared by every crate in the workspace. Variants
//! are grouped by where in the pipeline the failure originates: configuration,
//! plan resolution, the database backend, or an individual migration step.

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the migration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── Configuration ────────────────────────────────────────────────
    /// Bad database URI, unknown scheme or driver, missing source path,
    /// or a malformed configuration file.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Resolution ───────────────────────────────────────────────────
    /// Dependency cycle, unknown dependency, duplicate migration identity,
    /// or a missing target revision.
    #[error("resolution error: {0}")]
    Resolution(String),

    // ── Backend ──────────────────────────────────────────────────────
    /// Connection failure or SQL execution failure reported by the driver.
    #[error("database error: {0}")]
    Backend(String),

    /// The cross-process migration lock could not be acquired in time.
    #[error("could not acquire migration lock: {0}")]
    LockTimeout(String),

    /// An applied-set row conflict, e.g. the identity was already recorded
    /// by a concurrent migrator. The executor downgrades this to a warning
    /// during forward application.
    #[error("integrity error: {0}")]
    Integrity(String),

    // ── Execution ────────────────────────────────────────────────────
    /// A step body failed and no `ignore_errors` policy covered it.
    /// The message carries the driver's error text.
    #[error("migration {migration} failed {direction}: {message}")]
    Step {
        /// Identity of the migration whose step failed.
        migration: String,
        /// "applying" or "rolling back".
        direction: &'static str,
        /// The underlying error text.
        message: String,
    },

    /// The caller cancelled the run. The in-flight migration was rolled
    /// back and the lock released before this was surfaced.
    #[error("operation cancelled")]
    Cancelled,

    // ── I/O ──────────────────────────────────────────────────────────
    /// Filesystem failure during source discovery.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a [`Error::Step`] from a failed step execution.
    pub fn step(
        migration: impl Into<String>,
        direction: crate::Direction,
        message: impl Into<String>,
    ) -> Self {
        Self::Step {
            migration: migration.into(),
            direction: direction.verb(),
            message: message.into(),
        }
    }
}
