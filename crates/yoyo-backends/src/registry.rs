//! Process-wide backend registry.
//!
//! [`connect`] resolves a database URI to a backend through a registry keyed
//! on the URI scheme. The registry is pre-populated with the backends whose
//! cargo features are enabled; embedders can add their own schemes with
//! [`register_backend`] and restore the defaults with [`reset_registry`].
//! This is the engine's only process-wide state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use yoyo_core::{DatabaseUri, Error, MigrationConfig, Result};

use crate::base::MigrationBackend;

/// The boxed future a backend constructor returns.
pub type BackendFuture = Pin<Box<dyn Future<Output = Result<Box<dyn MigrationBackend>>> + Send>>;

/// Constructs a backend from a parsed URI and a configuration.
pub type BackendConstructor = fn(DatabaseUri, MigrationConfig) -> BackendFuture;

static REGISTRY: Lazy<RwLock<HashMap<String, BackendConstructor>>> =
    Lazy::new(|| RwLock::new(default_registry()));

fn default_registry() -> HashMap<String, BackendConstructor> {
    let mut map: HashMap<String, BackendConstructor> = HashMap::new();

    #[cfg(feature = "sqlite")]
    map.insert("sqlite".to_string(), sqlite_constructor as BackendConstructor);
    #[cfg(feature = "postgres")]
    map.insert(
        "postgresql".to_string(),
        postgres_constructor as BackendConstructor,
    );
    #[cfg(feature = "mysql")]
    map.insert("mysql".to_string(), mysql_constructor as BackendConstructor);

    map
}

#[cfg(feature = "sqlite")]
fn sqlite_constructor(uri: DatabaseUri, config: MigrationConfig) -> BackendFuture {
    Box::pin(async move {
        let backend = crate::sqlite::SqliteBackend::from_uri(&uri, &config)?;
        Ok(Box::new(backend) as Box<dyn MigrationBackend>)
    })
}

#[cfg(feature = "postgres")]
fn postgres_constructor(uri: DatabaseUri, config: MigrationConfig) -> BackendFuture {
    Box::pin(async move {
        let backend = crate::postgresql::PostgresBackend::connect(&uri, &config).await?;
        Ok(Box::new(backend) as Box<dyn MigrationBackend>)
    })
}

#[cfg(feature = "mysql")]
fn mysql_constructor(uri: DatabaseUri, config: MigrationConfig) -> BackendFuture {
    Box::pin(async move {
        let backend = crate::mysql::MySqlBackend::connect(&uri, &config).await?;
        Ok(Box::new(backend) as Box<dyn MigrationBackend>)
    })
}

/// Connects to the database addressed by `uri` and prepares the backend's
/// internal tables.
pub async fn connect(uri: &str, config: &MigrationConfig) -> Result<Box<dyn MigrationBackend>> {
    let parsed = DatabaseUri::parse(uri)?;

    let constructor = {
        let registry = REGISTRY.read().expect("backend registry poisoned");
        registry.get(&parsed.scheme).copied()
    };

    let constructor = constructor.ok_or_else(|| {
        Error::Configuration(format!(
            "no backend registered for scheme '{}' (is the matching cargo feature enabled?)",
            parsed.scheme
        ))
    })?;

    tracing::debug!("connecting to {parsed}");
    let backend = constructor(parsed, config.clone()).await?;
    backend.ensure_internal_tables().await?;
    Ok(backend)
}

/// Registers (or replaces) a backend constructor for a scheme.
pub fn register_backend(scheme: &str, constructor: BackendConstructor) {
    REGISTRY
        .write()
        .expect("backend registry poisoned")
        .insert(scheme.to_string(), constructor);
}

/// Restores the registry to the feature-selected defaults.
pub fn reset_registry() {
    *REGISTRY.write().expect("backend registry poisoned") = default_registry();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_unknown_scheme() {
        let result = connect("sqlite3://db", &MigrationConfig::default()).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let backend = connect("sqlite://:memory:", &MigrationConfig::default())
            .await
            .unwrap();
        assert_eq!(backend.vendor(), "sqlite");
        // ensure_internal_tables ran during connect.
        let tables = backend
            .query_strings("SELECT name FROM sqlite_master WHERE type='table'")
            .await
            .unwrap();
        assert!(tables.contains(&"_yoyo_migration".to_string()));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_register_and_reset() {
        fn ctor(uri: DatabaseUri, config: MigrationConfig) -> BackendFuture {
            Box::pin(async move {
                let backend = crate::sqlite::SqliteBackend::from_uri(&uri, &config)?;
                Ok(Box::new(backend) as Box<dyn MigrationBackend>)
            })
        }
        register_backend("sqlite", ctor);
        reset_registry();
        // Defaults are intact after a reset.
        let backend = connect("sqlite://:memory:", &MigrationConfig::default())
            .await
            .unwrap();
        assert_eq!(backend.vendor(), "sqlite");
    }
}
