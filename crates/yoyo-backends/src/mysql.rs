//! MySQL backend using `mysql_async`.
//!
//! The backend owns a single connection behind an async `Mutex`
//! (`mysql_async` execution methods take `&mut Conn`). MySQL DDL commits
//! implicitly, so [`MigrationBackend::disable_transactions`] returns true:
//! the executor still drives the two-level protocol but cannot promise
//! rollback for DDL steps and says so.
//!
//! The cross-process lock uses `GET_LOCK`/`RELEASE_LOCK`, named after the
//! database and migration table so unrelated databases on one server do not
//! contend.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use mysql_async::prelude::Queryable;
use tokio::sync::Mutex;

use yoyo_core::{DatabaseUri, Error, MigrationConfig, Result};

use crate::base::{AppliedMigration, MigrationBackend, SqlValue};

/// A MySQL migration backend.
pub struct MySqlBackend {
    conn: Mutex<mysql_async::Conn>,
    migration_table: String,
    lock_table: String,
    lock_name: String,
}

impl MySqlBackend {
    /// Connects using a parsed `mysql://` URI.
    ///
    /// The `mysql+mysqldb` scheme suffix is accepted as an alias for the
    /// same driver. Socket-only URIs carry the path in the `unix_socket`
    /// query parameter.
    pub async fn connect(uri: &DatabaseUri, config: &MigrationConfig) -> Result<Self> {
        let mut builder = mysql_async::OptsBuilder::default()
            .db_name(Some(uri.database.clone()))
            .user(uri.username.clone())
            .pass(uri.password.clone());

        if let Some(socket) = uri.query_param("unix_socket") {
            builder = builder.socket(Some(socket.to_string()));
        } else {
            builder = builder
                .ip_or_hostname(uri.host.clone().unwrap_or_else(|| "localhost".to_string()));
            if let Some(port) = uri.port {
                builder = builder.tcp_port(port);
            }
        }

        let conn = mysql_async::Conn::new(mysql_async::Opts::from(builder))
            .await
            .map_err(|e| Error::Backend(format!("MySQL connection failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            migration_table: config.migration_table.clone(),
            lock_table: config.lock_table.clone(),
            lock_name: format!("{}.{}", uri.database, config.migration_table),
        })
    }

    fn to_params(params: &[SqlValue]) -> Vec<mysql_async::Value> {
        params
            .iter()
            .map(|v| match v {
                SqlValue::Text(s) => mysql_async::Value::from(s.as_str()),
                SqlValue::Int(i) => mysql_async::Value::from(*i),
                SqlValue::Timestamp(ts) => mysql_async::Value::from(format_datetime(*ts)),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MigrationBackend for MySqlBackend {
    fn vendor(&self) -> &str {
        "mysql"
    }

    fn migration_table(&self) -> &str {
        &self.migration_table
    }

    fn lock_table(&self) -> &str {
        &self.lock_table
    }

    fn disable_transactions(&self) -> bool {
        // DDL statements commit implicitly.
        true
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        if params.is_empty() {
            conn.query_drop(sql)
                .await
                .map_err(|e| Error::Backend(format!("{e}")))?;
        } else {
            let mysql_params = mysql_async::Params::Positional(Self::to_params(params));
            conn.exec_drop(sql, mysql_params)
                .await
                .map_err(|e| Error::Backend(format!("{e}")))?;
        }
        Ok(conn.affected_rows())
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<mysql_async::Row> = conn
            .query(sql)
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let value: Option<mysql_async::Value> = row.get(0);
                match value {
                    None | Some(mysql_async::Value::NULL) => String::new(),
                    Some(mysql_async::Value::Bytes(b)) => String::from_utf8_lossy(&b).to_string(),
                    Some(mysql_async::Value::Int(i)) => i.to_string(),
                    Some(mysql_async::Value::UInt(u)) => u.to_string(),
                    Some(mysql_async::Value::Float(f)) => f.to_string(),
                    Some(mysql_async::Value::Double(d)) => d.to_string(),
                    Some(other) => format!("{other:?}"),
                }
            })
            .collect())
    }

    async fn ensure_internal_tables(&self) -> Result<()> {
        // TEXT cannot be a MySQL primary key; VARCHAR(255) carries the
        // identity instead.
        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS `{}` (\
                    id VARCHAR(255) PRIMARY KEY, \
                    ctime DATETIME(6)\
                )",
                self.migration_table
            ),
            &[],
        )
        .await?;
        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS `{}` (\
                    locked INT PRIMARY KEY, \
                    ctime DATETIME(6), \
                    pid INT\
                )",
                self.lock_table
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn list_applied(&self) -> Result<Vec<AppliedMigration>> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<(String, String)> = conn
            .query(format!(
                "SELECT id, DATE_FORMAT(ctime, '%Y-%m-%d %H:%i:%S.%f') \
                 FROM `{}` ORDER BY ctime, id",
                self.migration_table
            ))
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;

        rows.into_iter()
            .map(|(id, raw)| {
                let ctime = parse_datetime(&raw)?;
                Ok(AppliedMigration { id, ctime })
            })
            .collect()
    }

    async fn record_applied(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO `{}` (id, ctime) VALUES (?, ?)",
            self.migration_table
        );
        match conn.exec_drop(sql, (id, format_datetime(ts))).await {
            Ok(()) => Ok(()),
            // 1062 = ER_DUP_ENTRY
            Err(mysql_async::Error::Server(e)) if e.code == 1062 => Err(Error::Integrity(
                format!("migration '{id}' already recorded"),
            )),
            Err(e) => Err(Error::Backend(format!("{e}"))),
        }
    }

    async fn unrecord_applied(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let sql = format!("DELETE FROM `{}` WHERE id = ?", self.migration_table);
        conn.exec_drop(sql, (id,))
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;
        Ok(())
    }

    async fn lock(&self, timeout: Option<Duration>) -> Result<()> {
        // GET_LOCK treats a negative timeout as "wait forever".
        let secs: i64 = timeout.map_or(-1, |t| i64::try_from(t.as_secs().max(1)).unwrap_or(i64::MAX));
        let mut conn = self.conn.lock().await;
        let granted: Option<(Option<i64>,)> = conn
            .exec_first("SELECT GET_LOCK(?, ?)", (self.lock_name.as_str(), secs))
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;

        match granted.and_then(|row| row.0) {
            Some(1) => Ok(()),
            Some(_) => Err(Error::LockTimeout(format!(
                "GET_LOCK('{}') timed out",
                self.lock_name
            ))),
            None => Err(Error::Backend(format!(
                "GET_LOCK('{}') returned NULL",
                self.lock_name
            ))),
        }
    }

    async fn unlock(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.exec_drop("SELECT RELEASE_LOCK(?)", (self.lock_name.as_str(),))
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;
        Ok(())
    }
}

fn format_datetime(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Backend(format!("bad ctime '{raw}': {e}")))
}
