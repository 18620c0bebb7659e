//! SQLite backend using `rusqlite`.
//!
//! The connection is owned behind an async `Mutex` and every call runs via
//! `tokio::task::spawn_blocking`, keeping the async trait surface uniform
//! with the network backends.
//!
//! SQLite has transactional DDL but no advisory lock primitive. The
//! cross-process lock is a row in the lock table written with
//! `INSERT OR ABORT`: the table's single-row primary key makes the insert
//! fail while another process holds the lock, and SQLite's single-writer
//! model serializes the inserts themselves.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;

use yoyo_core::{DatabaseUri, Error, MigrationConfig, Result};

use crate::base::{AppliedMigration, MigrationBackend, SqlValue};

/// How long to sleep between lock-table insert attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A SQLite migration backend.
pub struct SqliteBackend {
    /// The database file path, or ":memory:".
    path: PathBuf,
    conn: Arc<Mutex<rusqlite::Connection>>,
    migration_table: String,
    lock_table: String,
}

impl SqliteBackend {
    /// Opens the database at `path`, creating the file if needed.
    /// `:memory:` opens an in-memory database.
    pub fn open(path: impl Into<PathBuf>, config: &MigrationConfig) -> Result<Self> {
        let path = path.into();
        let conn = if path.to_str() == Some(":memory:") {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| Error::Backend(format!("SQLite open failed: {e}")))?;

        // busy_timeout keeps short internal writes from surfacing
        // SQLITE_BUSY when another migrator holds the file briefly.
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .map_err(|e| Error::Backend(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            migration_table: config.migration_table.clone(),
            lock_table: config.lock_table.clone(),
        })
    }

    /// Opens an in-memory database.
    pub fn memory(config: &MigrationConfig) -> Result<Self> {
        Self::open(":memory:", config)
    }

    /// Opens the database addressed by a parsed `sqlite://` URI.
    pub fn from_uri(uri: &DatabaseUri, config: &MigrationConfig) -> Result<Self> {
        if uri.is_memory() {
            Self::memory(config)
        } else {
            Self::open(uri.database.clone(), config)
        }
    }

    /// Returns the database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[SqlValue]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                SqlValue::Text(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                SqlValue::Int(v) => stmt.raw_bind_parameter(idx, v),
                SqlValue::Timestamp(ts) => stmt
                    .raw_bind_parameter(idx, ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            }
            .map_err(|e| Error::Backend(format!("bind error: {e}")))?;
        }
        Ok(())
    }

    /// Runs the lock-table insert once; `Ok(false)` means contention.
    async fn try_lock_insert(&self) -> Result<bool> {
        let conn = self.conn.clone();
        let sql = format!(
            "INSERT OR ABORT INTO \"{}\" (locked, ctime, pid) VALUES (1, ?1, ?2)",
            self.lock_table
        );
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let pid = i64::from(std::process::id());

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            match conn.execute(&sql, rusqlite::params![now, pid]) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(Error::Backend(format!("{e}"))),
            }
        })
        .await
        .map_err(|e| Error::Backend(format!("task join error: {e}")))?
    }
}

#[async_trait::async_trait]
impl MigrationBackend for SqliteBackend {
    fn vendor(&self) -> &str {
        "sqlite"
    }

    fn migration_table(&self) -> &str {
        &self.migration_table
    }

    fn lock_table(&self) -> &str {
        &self.lock_table
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            if params.is_empty() {
                // Batch execution also accepts multi-statement step bodies.
                conn.execute_batch(&sql)
                    .map_err(|e| Error::Backend(format!("{e}")))?;
                Ok(0)
            } else {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| Error::Backend(format!("{e}")))?;
                Self::bind_params(&mut stmt, &params)?;
                let count = stmt
                    .raw_execute()
                    .map_err(|e| Error::Backend(format!("{e}")))?;
                Ok(count as u64)
            }
        })
        .await
        .map_err(|e| Error::Backend(format!("task join error: {e}")))?
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::Backend(format!("{e}")))?;
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| Error::Backend(format!("{e}")))? {
                let value = match row
                    .get_ref(0)
                    .map_err(|e| Error::Backend(format!("{e}")))?
                {
                    rusqlite::types::ValueRef::Null => String::new(),
                    rusqlite::types::ValueRef::Integer(v) => v.to_string(),
                    rusqlite::types::ValueRef::Real(v) => v.to_string(),
                    rusqlite::types::ValueRef::Text(b) => String::from_utf8_lossy(b).to_string(),
                    rusqlite::types::ValueRef::Blob(b) => format!("{b:?}"),
                };
                out.push(value);
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Backend(format!("task join error: {e}")))?
    }

    async fn ensure_internal_tables(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
                id TEXT PRIMARY KEY, \
                ctime TIMESTAMP\
            );\n\
            CREATE TABLE IF NOT EXISTS \"{}\" (\
                locked INTEGER PRIMARY KEY, \
                ctime TIMESTAMP, \
                pid INTEGER\
            );",
            self.migration_table, self.lock_table
        );
        self.execute(&ddl, &[]).await?;
        Ok(())
    }

    async fn list_applied(&self) -> Result<Vec<AppliedMigration>> {
        let conn = self.conn.clone();
        let sql = format!(
            "SELECT id, ctime FROM \"{}\" ORDER BY ctime, id",
            self.migration_table
        );

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::Backend(format!("{e}")))?;
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| Error::Backend(format!("{e}")))? {
                let id: String = row.get(0).map_err(|e| Error::Backend(format!("{e}")))?;
                let raw: String = row.get(1).map_err(|e| Error::Backend(format!("{e}")))?;
                let ctime = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| Error::Backend(format!("bad ctime '{raw}': {e}")))?
                    .with_timezone(&Utc);
                out.push(AppliedMigration { id, ctime });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Backend(format!("task join error: {e}")))?
    }

    async fn record_applied(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.clone();
        let sql = format!(
            "INSERT INTO \"{}\" (id, ctime) VALUES (?1, ?2)",
            self.migration_table
        );
        let id = id.to_string();
        let ts = ts.to_rfc3339_opts(SecondsFormat::Micros, true);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            match conn.execute(&sql, rusqlite::params![id, ts]) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(Error::Integrity(format!("migration '{id}' already recorded")))
                }
                Err(e) => Err(Error::Backend(format!("{e}"))),
            }
        })
        .await
        .map_err(|e| Error::Backend(format!("task join error: {e}")))?
    }

    async fn unrecord_applied(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?1", self.migration_table);
        self.execute(&sql, &[SqlValue::from(id)]).await?;
        Ok(())
    }

    async fn lock(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_lock_insert().await? {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout(format!(
                        "lock table \"{}\" is held by another process",
                        self.lock_table
                    )));
                }
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self) -> Result<()> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE locked = 1 AND pid = ?1",
            self.lock_table
        );
        self.execute(&sql, &[SqlValue::Int(i64::from(std::process::id()))])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SqliteBackend {
        SqliteBackend::memory(&MigrationConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let b = backend();
        b.execute("CREATE TABLE t (x TEXT)", &[]).await.unwrap();
        b.execute("INSERT INTO t VALUES (?1)", &[SqlValue::from("hello")])
            .await
            .unwrap();
        let rows = b.query_strings("SELECT x FROM t").await.unwrap();
        assert_eq!(rows, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_internal_tables_created() {
        let b = backend();
        b.ensure_internal_tables().await.unwrap();
        let tables = b
            .query_strings("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .await
            .unwrap();
        assert!(tables.contains(&"_yoyo_migration".to_string()));
        assert!(tables.contains(&"_yoyo_lock".to_string()));
    }

    #[tokio::test]
    async fn test_record_and_list_applied() {
        let b = backend();
        b.ensure_internal_tables().await.unwrap();
        let ts = Utc::now();
        b.record_applied("0001_initial", ts).await.unwrap();
        let applied = b.list_applied().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, "0001_initial");
        // Stored with microsecond precision.
        assert_eq!(applied[0].ctime.timestamp_micros(), ts.timestamp_micros());
    }

    #[tokio::test]
    async fn test_record_duplicate_is_integrity_error() {
        let b = backend();
        b.ensure_internal_tables().await.unwrap();
        b.record_applied("0001", Utc::now()).await.unwrap();
        let err = b.record_applied("0001", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_unrecord_applied() {
        let b = backend();
        b.ensure_internal_tables().await.unwrap();
        b.record_applied("0001", Utc::now()).await.unwrap();
        b.unrecord_applied("0001").await.unwrap();
        assert!(b.list_applied().await.unwrap().is_empty());
        // Deleting an absent row is not an error.
        b.unrecord_applied("0001").await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_changes() {
        let b = backend();
        b.execute("CREATE TABLE t (x TEXT)", &[]).await.unwrap();
        b.begin().await.unwrap();
        b.execute("INSERT INTO t VALUES ('gone')", &[]).await.unwrap();
        b.rollback().await.unwrap();
        assert!(b.query_strings("SELECT x FROM t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_work() {
        let b = backend();
        b.execute("CREATE TABLE t (x TEXT)", &[]).await.unwrap();
        b.begin().await.unwrap();
        b.execute("INSERT INTO t VALUES ('kept')", &[]).await.unwrap();
        b.savepoint("yoyo_sp_0").await.unwrap();
        b.execute("INSERT INTO t VALUES ('dropped')", &[])
            .await
            .unwrap();
        b.rollback_to_savepoint("yoyo_sp_0").await.unwrap();
        b.commit().await.unwrap();
        let rows = b.query_strings("SELECT x FROM t").await.unwrap();
        assert_eq!(rows, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_blocks_second_holder() {
        let b = backend();
        b.ensure_internal_tables().await.unwrap();
        b.lock(Some(Duration::from_millis(10))).await.unwrap();
        let err = b.lock(Some(Duration::from_millis(150))).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        b.unlock().await.unwrap();
        b.lock(Some(Duration::from_millis(10))).await.unwrap();
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_uri_memory() {
        let uri = DatabaseUri::parse("sqlite://:memory:").unwrap();
        let b = SqliteBackend::from_uri(&uri, &MigrationConfig::default()).unwrap();
        assert_eq!(b.vendor(), "sqlite");
    }
}
