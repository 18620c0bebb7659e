//! The `yoyo.ini` configuration file loader.
//!
//! INI-style with a `[DEFAULT]` section. Recognized keys: `sources`
//! (space-separated paths), `database`, `verbosity`, `batch_mode`,
//! `editor`, `post_create_command`, `migration_table`.
//!
//! Two extensions beyond plain INI:
//! - `%inherit path` pulls in another config file; inherited values are
//!   loaded first and overridden by the including file.
//! - `%(here)s` in a value expands to the directory containing the config
//!   file it appears in, so `sources = %(here)s/migrations` works from any
//!   working directory.
//!
//! The format is hand-parsed: the `%inherit`/`%(here)s` extensions are not
//! part of any INI crate's dialect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "yoyo.ini";

/// Inheritance depth guard against `%inherit` cycles.
const MAX_INHERIT_DEPTH: usize = 10;

/// Loads a config file, following `%inherit` directives.
///
/// Returns the `[DEFAULT]` section as a key → value map. Keys that appear
/// before any section header also count as `[DEFAULT]`.
pub fn load_config(path: &Path) -> Result<HashMap<String, String>> {
    load_config_inner(path, 0)
}

fn load_config_inner(path: &Path, depth: usize) -> Result<HashMap<String, String>> {
    if depth > MAX_INHERIT_DEPTH {
        bail!(
            "config inheritance deeper than {MAX_INHERIT_DEPTH} levels at '{}' \
             (inheritance cycle?)",
            path.display()
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file '{}'", path.display()))?;
    let here = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut values: HashMap<String, String> = HashMap::new();
    let mut in_default = true;

    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(target) = line.strip_prefix("%inherit") {
            let target = target.trim();
            if target.is_empty() {
                bail!(
                    "{}:{}: %inherit needs a path",
                    path.display(),
                    line_number + 1
                );
            }
            let inherited_path = resolve_relative(&here, target);
            let inherited = load_config_inner(&inherited_path, depth + 1)?;
            for (key, value) in inherited {
                values.entry(key).or_insert(value);
            }
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            let section = section.trim_end_matches(']').trim();
            in_default = section.eq_ignore_ascii_case("DEFAULT");
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "{}:{}: expected 'key = value', got '{line}'",
                path.display(),
                line_number + 1
            );
        };
        if in_default {
            let value = value.trim().replace("%(here)s", &here.to_string_lossy());
            values.insert(key.trim().to_string(), value);
        }
    }

    Ok(values)
}

fn resolve_relative(here: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        here.join(target)
    }
}
