//! The `yoyo new` command: scaffold a migration script.
//!
//! The new script depends on the current leaf migrations (those nothing
//! else depends on yet), so freshly created migrations chain onto the end
//! of the graph by default.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};

use yoyo_migrations::sources::scan_depends;

use crate::settings::Settings;

/// Creates `<prefix>_<slug>.sql` and an empty rollback script in the first
/// source directory, opens the editor unless suppressed, and runs the
/// configured `post_create_command`. Returns the new script's path.
pub fn new_migration(
    settings: &Settings,
    message: Option<&str>,
    no_edit: bool,
) -> Result<PathBuf> {
    let sources = settings.require_sources()?;
    let dir = &sources[0];
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create source directory '{}'", dir.display()))?;

    let existing = scan_depends(dir)?;
    let id = format!(
        "{:04}_{}",
        next_prefix(&existing),
        slugify(message.unwrap_or("migration"))
    );
    let leaves = leaf_ids(&existing);

    let mut header = String::new();
    if let Some(message) = message {
        header.push_str(&format!("-- message: {message}\n"));
    }
    if !leaves.is_empty() {
        header.push_str(&format!("-- depends: {}\n", leaves.join(" ")));
    }
    if let Ok(user) = std::env::var("USER") {
        header.push_str(&format!("-- author: {user}\n"));
    }
    header.push_str(&format!(
        "-- created: {}\n\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    let path = dir.join(format!("{id}.sql"));
    std::fs::write(&path, &header)
        .with_context(|| format!("cannot write '{}'", path.display()))?;
    let rollback_path = dir.join(format!("{id}.rollback.sql"));
    std::fs::write(&rollback_path, "")
        .with_context(|| format!("cannot write '{}'", rollback_path.display()))?;

    println!("created {}", path.display());

    if !no_edit && !settings.batch_mode {
        open_editor(settings, &path)?;
    }

    if let Some(command) = &settings.post_create_command {
        run_post_create(command, &path)?;
    }

    Ok(path)
}

/// The next numeric filename prefix: one past the highest existing one.
fn next_prefix(existing: &[(String, Vec<String>)]) -> u32 {
    existing
        .iter()
        .filter_map(|(id, _)| {
            id.split('_')
                .next()
                .and_then(|prefix| prefix.parse::<u32>().ok())
        })
        .max()
        .map_or(1, |max| max + 1)
}

/// Identities no other migration depends on: the graph's current leaves.
fn leaf_ids(existing: &[(String, Vec<String>)]) -> Vec<String> {
    let mut leaves: Vec<String> = existing
        .iter()
        .filter(|(id, _)| {
            !existing
                .iter()
                .any(|(_, depends)| depends.iter().any(|dep| dep == id))
        })
        .map(|(id, _)| id.clone())
        .collect();
    leaves.sort();
    leaves
}

fn slugify(message: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in message.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug.to_string()
    }
}

fn open_editor(settings: &Settings, path: &Path) -> Result<()> {
    let editor = settings
        .editor
        .clone()
        .or_else(|| std::env::var("VISUAL").ok())
        .or_else(|| std::env::var("EDITOR").ok());
    let Some(editor) = editor else {
        tracing::debug!("no editor configured; leaving the script as created");
        return Ok(());
    };

    let mut parts = editor.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(());
    };
    let status = std::process::Command::new(program)
        .args(parts)
        .arg(path)
        .status()
        .with_context(|| format!("failed to launch editor '{editor}'"))?;
    if !status.success() {
        bail!("editor '{editor}' exited with {status}");
    }
    Ok(())
}

/// Runs the configured post-create command. A literal `{}` is replaced
/// with the script path; without one the path is appended.
fn run_post_create(command: &str, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    let mut parts: Vec<String> = command.split_whitespace().map(String::from).collect();
    if parts.is_empty() {
        return Ok(());
    }
    let mut substituted = false;
    for part in &mut parts {
        if part == "{}" {
            *part = path_str.to_string();
            substituted = true;
        }
    }
    if !substituted {
        parts.push(path_str.to_string());
    }

    let status = std::process::Command::new(&parts[0])
        .args(&parts[1..])
        .status()
        .with_context(|| format!("failed to run post_create_command '{command}'"))?;
    if !status.success() {
        bail!("post_create_command '{command}' exited with {status}");
    }
    Ok(())
}
