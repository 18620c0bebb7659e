//! The backend adapter trait and its supporting types.
//!
//! [`MigrationBackend`] is the boundary between the engine and a concrete SQL
//! driver. The executor drives the whole two-level transaction protocol
//! through it: one outer transaction per migration, one savepoint per step,
//! and the applied-set mutation inside the outer transaction.
//!
//! Implementations own exactly one database connection for the duration of an
//! operation. Transaction state and advisory locks are session-scoped in
//! every supported engine, so a connection pool cannot sit behind this trait.

use std::time::Duration;

use chrono::{DateTime, Utc};

use yoyo_core::Result;

/// A parameter bound to a SQL statement.
///
/// The engine itself only ever binds migration identities and timestamps;
/// callable steps that need richer parameter types talk to the driver through
/// the SQL text they execute.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// A text value.
    Text(String),
    /// A 64-bit integer.
    Int(i64),
    /// A UTC timestamp.
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

/// One row of the applied-set table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// The migration identity.
    pub id: String,
    /// When the migration was recorded as applied (UTC).
    pub ctime: DateTime<Utc>,
}

/// Uniform interface over a concrete SQL driver.
///
/// All methods are async; synchronous drivers (`rusqlite`) wrap their calls
/// in `tokio::task::spawn_blocking` to keep the interface uniform.
///
/// The transaction-control and savepoint methods have default implementations
/// issuing the standard SQL, which every supported engine accepts. Savepoint
/// names are engine-generated identifiers, never user input.
#[async_trait::async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Returns the vendor name (e.g. "postgresql", "sqlite", "mysql").
    fn vendor(&self) -> &str;

    /// Name of the applied-set table this backend was configured with.
    fn migration_table(&self) -> &str;

    /// Name of the lock table this backend was configured with.
    fn lock_table(&self) -> &str;

    /// True when this engine's DDL cannot participate in transactions
    /// (MySQL: DDL statements commit implicitly). The executor still runs
    /// the two-level protocol against such backends but warns the caller
    /// and, on failure, reports the steps that had already run.
    fn disable_transactions(&self) -> bool {
        false
    }

    /// Executes a statement, returning the affected row count where the
    /// driver reports one. Statements without parameters may contain
    /// multiple `;`-separated statements.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Runs a query and returns the first column of each row as text.
    /// Used for introspection by callable steps and tests.
    async fn query_strings(&self, sql: &str) -> Result<Vec<String>>;

    // ── Transaction protocol ─────────────────────────────────────────

    /// Opens the outer transaction.
    async fn begin(&self) -> Result<()> {
        self.execute("BEGIN", &[]).await?;
        Ok(())
    }

    /// Commits the outer transaction.
    async fn commit(&self) -> Result<()> {
        self.execute("COMMIT", &[]).await?;
        Ok(())
    }

    /// Rolls back the outer transaction.
    async fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK", &[]).await?;
        Ok(())
    }

    /// Opens a savepoint.
    async fn savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT {name}"), &[]).await?;
        Ok(())
    }

    /// Releases a savepoint, keeping its effects.
    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        Ok(())
    }

    /// Rolls back to a savepoint, discarding the effects since it opened.
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        Ok(())
    }

    // ── Applied-set table ────────────────────────────────────────────

    /// Creates the applied-set and lock tables if they do not exist.
    async fn ensure_internal_tables(&self) -> Result<()>;

    /// Lists the applied-set rows, ordered by application time then id.
    async fn list_applied(&self) -> Result<Vec<AppliedMigration>>;

    /// Inserts an applied-set row. A key conflict maps to
    /// [`Error::Integrity`](yoyo_core::Error::Integrity) so the executor can
    /// treat a concurrent migrator's insert as a warning.
    async fn record_applied(&self, id: &str, ts: DateTime<Utc>) -> Result<()>;

    /// Deletes an applied-set row. Deleting an absent row is not an error.
    async fn unrecord_applied(&self, id: &str) -> Result<()>;

    // ── Cross-process lock ───────────────────────────────────────────

    /// Acquires the advisory lock serializing migrator processes.
    /// `None` waits indefinitely; otherwise fails with
    /// [`Error::LockTimeout`](yoyo_core::Error::LockTimeout) once the
    /// timeout elapses.
    async fn lock(&self, timeout: Option<Duration>) -> Result<()>;

    /// Releases the advisory lock. Safe to call when not held.
    async fn unlock(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_from_str() {
        assert_eq!(SqlValue::from("abc"), SqlValue::Text("abc".to_string()));
    }

    #[test]
    fn test_sql_value_from_timestamp() {
        let now = Utc::now();
        assert_eq!(SqlValue::from(now), SqlValue::Timestamp(now));
    }
}
