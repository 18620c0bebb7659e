//! PostgreSQL backend using `tokio-postgres`.
//!
//! The backend owns a single client plus its spawned connection task.
//! Advisory locks and transaction state are session-scoped in PostgreSQL,
//! so the one-client-per-operation ownership is load-bearing, not a
//! simplification.
//!
//! The cross-process lock is a session advisory lock keyed on a stable
//! 64-bit FNV-1a hash of the migration table name, computed client-side so
//! the key does not depend on server collation or encoding.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;

use yoyo_core::{DatabaseUri, Error, MigrationConfig, Result};

use crate::base::{AppliedMigration, MigrationBackend, SqlValue};

/// How long to sleep between `pg_try_advisory_lock` attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A PostgreSQL migration backend.
pub struct PostgresBackend {
    client: tokio_postgres::Client,
    migration_table: String,
    lock_table: String,
    lock_key: i64,
}

impl PostgresBackend {
    /// Connects using a parsed `postgresql://` URI.
    pub async fn connect(uri: &DatabaseUri, config: &MigrationConfig) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.dbname(&uri.database);
        if let Some(host) = uri.host.as_deref().or_else(|| uri.query_param("host")) {
            pg.host(host);
        } else {
            pg.host("localhost");
        }
        if let Some(port) = uri.port {
            pg.port(port);
        }
        if let Some(user) = &uri.username {
            pg.user(user);
        }
        if let Some(password) = &uri.password {
            pg.password(password);
        }

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|e| Error::Backend(format!("PostgreSQL connection failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgresql connection task ended: {e}");
            }
        });

        Ok(Self {
            client,
            migration_table: config.migration_table.clone(),
            lock_table: config.lock_table.clone(),
            lock_key: advisory_lock_key(&config.migration_table),
        })
    }

    fn to_sql_params(
        params: &[SqlValue],
    ) -> Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>> {
        params
            .iter()
            .map(|v| -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
                match v {
                    SqlValue::Text(s) => Box::new(s.clone()),
                    SqlValue::Int(i) => Box::new(*i),
                    SqlValue::Timestamp(ts) => Box::new(*ts),
                }
            })
            .collect()
    }

    async fn try_advisory_lock(&self) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.lock_key])
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;
        row.try_get(0).map_err(|e| Error::Backend(format!("{e}")))
    }
}

#[async_trait::async_trait]
impl MigrationBackend for PostgresBackend {
    fn vendor(&self) -> &str {
        "postgresql"
    }

    fn migration_table(&self) -> &str {
        &self.migration_table
    }

    fn lock_table(&self) -> &str {
        &self.lock_table
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        if params.is_empty() {
            // The simple protocol also accepts transaction control and
            // multi-statement step bodies.
            self.client
                .batch_execute(sql)
                .await
                .map_err(|e| Error::Backend(format!("{e}")))?;
            return Ok(0);
        }

        let sql_params = Self::to_sql_params(params);
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = sql_params
            .iter()
            .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| Error::Backend(format!("{e}")))
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;

        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                tokio_postgres::SimpleQueryMessage::Row(row) => {
                    Some(row.get(0).unwrap_or_default().to_string())
                }
                _ => None,
            })
            .collect())
    }

    async fn ensure_internal_tables(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\
                id TEXT PRIMARY KEY, \
                ctime TIMESTAMPTZ\
            );\n\
            CREATE TABLE IF NOT EXISTS \"{}\" (\
                locked INTEGER PRIMARY KEY, \
                ctime TIMESTAMPTZ, \
                pid INTEGER\
            );",
            self.migration_table, self.lock_table
        );
        self.execute(&ddl, &[]).await?;
        Ok(())
    }

    async fn list_applied(&self) -> Result<Vec<AppliedMigration>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT id, ctime FROM \"{}\" ORDER BY ctime, id",
                    self.migration_table
                ),
                &[],
            )
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get(0).map_err(|e| Error::Backend(format!("{e}")))?;
                let ctime: DateTime<Utc> =
                    row.try_get(1).map_err(|e| Error::Backend(format!("{e}")))?;
                Ok(AppliedMigration { id, ctime })
            })
            .collect()
    }

    async fn record_applied(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "INSERT INTO \"{}\" (id, ctime) VALUES ($1, $2)",
            self.migration_table
        );
        match self.client.execute(&sql, &[&id, &ts]).await {
            Ok(_) => Ok(()),
            Err(e)
                if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) =>
            {
                Err(Error::Integrity(format!("migration '{id}' already recorded")))
            }
            Err(e) => Err(Error::Backend(format!("{e}"))),
        }
    }

    async fn unrecord_applied(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\" WHERE id = $1", self.migration_table);
        self.client
            .execute(&sql, &[&id])
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;
        Ok(())
    }

    async fn lock(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => {
                // Blocks server-side until the lock is granted.
                self.client
                    .query("SELECT pg_advisory_lock($1)", &[&self.lock_key])
                    .await
                    .map_err(|e| Error::Backend(format!("{e}")))?;
                Ok(())
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if self.try_advisory_lock().await? {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(format!(
                            "advisory lock {} is held by another session",
                            self.lock_key
                        )));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn unlock(&self) -> Result<()> {
        self.client
            .query("SELECT pg_advisory_unlock($1)", &[&self.lock_key])
            .await
            .map_err(|e| Error::Backend(format!("{e}")))?;
        Ok(())
    }
}

/// Stable 64-bit FNV-1a hash of the migration table name, reinterpreted as
/// the signed key `pg_advisory_lock` expects.
fn advisory_lock_key(table: &str) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in table.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    i64::from_ne_bytes(hash.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        let a = advisory_lock_key("_yoyo_migration");
        let b = advisory_lock_key("_yoyo_migration");
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_key_varies_by_table() {
        assert_ne!(
            advisory_lock_key("_yoyo_migration"),
            advisory_lock_key("schema_version")
        );
    }

    #[test]
    fn test_lock_key_known_value() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(
            advisory_lock_key(""),
            i64::from_ne_bytes(0xcbf2_9ce4_8422_2325_u64.to_ne_bytes())
        );
    }
}
