//! Engine configuration, interactive-confirmation types, and cancellation.
//!
//! [`MigrationConfig`] replaces per-call keyword arguments with one explicit
//! struct handed to the executor and the façade functions. The defaults suit
//! unattended (batch) library use; the CLI overrides them from its flags and
//! configuration file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{DEFAULT_LOCK_TABLE, DEFAULT_MIGRATION_TABLE};

/// Settings that shape a migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// When true, never prompt; apply the whole plan unattended.
    pub batch_mode: bool,
    /// Output verbosity, 0–3. Only consulted by front-ends; the engine
    /// itself emits `tracing` events regardless.
    pub verbosity: u8,
    /// Name of the applied-set table.
    pub migration_table: String,
    /// Name of the lock table used by backends without a native advisory
    /// lock primitive.
    pub lock_table: String,
    /// How long to wait for the cross-process lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Keep executing later plan items after one migration aborts.
    pub continue_on_failure: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_mode: true,
            verbosity: 0,
            migration_table: DEFAULT_MIGRATION_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_timeout: None,
            continue_on_failure: false,
        }
    }
}

impl MigrationConfig {
    /// Creates a configuration with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets batch mode (no interactive prompting).
    pub fn batch_mode(mut self, batch: bool) -> Self {
        self.batch_mode = batch;
        self
    }

    /// Sets the applied-set table name.
    pub fn migration_table(mut self, table: impl Into<String>) -> Self {
        self.migration_table = table.into();
        self
    }

    /// Sets the lock table name.
    pub fn lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    /// Sets the lock acquisition timeout.
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether the plan keeps going after a migration aborts.
    pub fn continue_on_failure(mut self, keep_going: bool) -> Self {
        self.continue_on_failure = keep_going;
        self
    }
}

/// The caller's answer when the executor asks for confirmation before a
/// migration in interactive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run this migration.
    Yes,
    /// Skip this migration; continue asking about the rest.
    No,
    /// Run this and every remaining migration without asking again.
    All,
    /// Stop the run cleanly. Migrations already committed stand.
    Quit,
}

/// Callback consulted per migration in interactive mode.
///
/// Arguments are the migration identity and the direction it is about to be
/// driven in.
pub type ConfirmFn = Arc<dyn Fn(&str, crate::Direction) -> Decision + Send + Sync>;

/// Cheap clonable cancellation flag.
///
/// The executor checks the token between steps and between migrations; when
/// it observes cancellation it rolls back the in-flight outer transaction,
/// releases the lock, and returns [`Error::Cancelled`](crate::Error::Cancelled).
/// Mid-step cancellation is best-effort — step bodies are not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = MigrationConfig::default();
        assert!(cfg.batch_mode);
        assert_eq!(cfg.migration_table, "_yoyo_migration");
        assert_eq!(cfg.lock_table, "_yoyo_lock");
        assert!(cfg.lock_timeout.is_none());
        assert!(!cfg.continue_on_failure);
    }

    #[test]
    fn test_config_builder() {
        let cfg = MigrationConfig::new()
            .batch_mode(false)
            .migration_table("schema_version")
            .lock_timeout(Some(Duration::from_secs(5)))
            .continue_on_failure(true);
        assert!(!cfg.batch_mode);
        assert_eq!(cfg.migration_table, "schema_version");
        assert_eq!(cfg.lock_timeout, Some(Duration::from_secs(5)));
        assert!(cfg.continue_on_failure);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
