//! Merged CLI settings: defaults ← config file ← command-line flags.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};

use yoyo_core::MigrationConfig;

/// Everything a command needs, after flag/config-file merging.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Migration source directories.
    pub sources: Vec<PathBuf>,
    /// Database URI.
    pub database: Option<String>,
    /// Never prompt.
    pub batch_mode: bool,
    /// 0–3.
    pub verbosity: u8,
    /// Editor command for `yoyo new`.
    pub editor: Option<String>,
    /// Command run after `yoyo new` creates a script.
    pub post_create_command: Option<String>,
    /// Applied-set table name.
    pub migration_table: String,
}

impl Settings {
    /// Merges config-file values with command-line flags. Flags win.
    pub fn resolve(
        file: Option<&HashMap<String, String>>,
        cli_database: Option<String>,
        cli_sources: &[PathBuf],
        cli_batch: bool,
        cli_verbose: u8,
    ) -> Self {
        let get = |key: &str| file.and_then(|values| values.get(key)).cloned();

        let sources = if cli_sources.is_empty() {
            get("sources")
                .map(|value| value.split_whitespace().map(PathBuf::from).collect())
                .unwrap_or_default()
        } else {
            cli_sources.to_vec()
        };

        let file_batch = get("batch_mode")
            .map(|value| matches!(value.as_str(), "true" | "yes" | "on" | "1"))
            .unwrap_or(false);

        let file_verbosity = get("verbosity")
            .and_then(|value| value.parse::<u8>().ok())
            .unwrap_or(0);

        Self {
            sources,
            database: cli_database.or_else(|| get("database")),
            batch_mode: cli_batch || file_batch,
            verbosity: if cli_verbose > 0 {
                cli_verbose.min(3)
            } else {
                file_verbosity.min(3)
            },
            editor: get("editor"),
            post_create_command: get("post_create_command"),
            migration_table: get("migration_table")
                .unwrap_or_else(|| yoyo_core::DEFAULT_MIGRATION_TABLE.to_string()),
        }
    }

    /// The database URI, or a configuration error telling the user where to
    /// put one.
    pub fn database(&self) -> Result<&str> {
        match &self.database {
            Some(uri) => Ok(uri),
            None => bail!("no database URI given (use --database or set it in yoyo.ini)"),
        }
    }

    /// The source directories, or an error if none are configured.
    pub fn require_sources(&self) -> Result<&[PathBuf]> {
        if self.sources.is_empty() {
            bail!("no migration sources given (pass directories or set sources in yoyo.ini)");
        }
        Ok(&self.sources)
    }

    /// Builds the engine configuration for these settings.
    pub fn migration_config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::default()
            .batch_mode(self.batch_mode)
            .migration_table(self.migration_table.clone());
        config.verbosity = self.verbosity;
        config
    }
}
