//! Filesystem source discovery.
//!
//! A migration source directory holds SQL scripts, one migration per file.
//! The filename stem is the migration identity; `<stem>.rollback.sql`
//! beside an apply script supplies the rollback statements. Header comment
//! lines at the top of the apply script declare dependencies and policies:
//!
//! ```sql
//! -- depends: 0001_initial 0002_users
//! -- ignore-errors: apply
//! -- author: alice
//! CREATE TABLE posts (id INTEGER PRIMARY KEY);
//! ```
//!
//! Scripts are split into statements on top-level `;`, with awareness of
//! quotes, line and block comments, and PostgreSQL dollar-quoted bodies.
//! The engine does not validate the SQL itself — statements are handed to
//! the backend verbatim.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;

use yoyo_core::{Error, Result};

use crate::migration::{IgnoreErrors, Migration, MigrationMetadata, MigrationSet, Step};

/// Reads every migration script under the given source directories.
///
/// Identity collisions across directories are a hard error; a `post-apply`
/// script is segregated into [`MigrationSet::post_apply`].
pub fn read_migrations(paths: &[PathBuf]) -> Result<MigrationSet> {
    let mut migrations = Vec::new();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();

    for dir in paths {
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "migration source '{}' does not exist or is not a directory",
                dir.display()
            )));
        }

        let mut scripts: Vec<PathBuf> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| is_apply_script(path))
            .collect();
        scripts.sort();

        for path in scripts {
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            if id.is_empty() {
                continue;
            }
            if let Some(previous) = seen.get(&id) {
                return Err(Error::Resolution(format!(
                    "duplicate migration identity '{id}': defined in both '{}' and '{}'",
                    previous.display(),
                    path.display()
                )));
            }
            seen.insert(id.clone(), path.clone());
            migrations.push(load_migration(&path, id)?);
        }
    }

    MigrationSet::new(migrations)
}

fn is_apply_script(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    path.is_file() && name.ends_with(".sql") && !name.ends_with(".rollback.sql")
}

fn load_migration(path: &Path, id: String) -> Result<Migration> {
    let content = std::fs::read_to_string(path)?;
    let header = parse_header(&content, path)?;

    let apply_statements = split_statements(&content);
    if apply_statements.is_empty() {
        return Err(Error::Configuration(format!(
            "migration script '{}' contains no statements",
            path.display()
        )));
    }

    let rollback_path = path.with_extension("rollback.sql");
    let rollback_statements = if rollback_path.is_file() {
        split_statements(&std::fs::read_to_string(&rollback_path)?)
    } else {
        Vec::new()
    };

    let steps = pair_steps(apply_statements, rollback_statements, header.ignore_errors);

    let mut migration = Migration::new(id)
        .from_source(path)
        .transactional(header.transactional);
    migration.depends = header.depends;
    migration.metadata = header.metadata;
    migration.steps = steps;
    Ok(migration)
}

/// Pairs apply statements with rollback statements.
///
/// The rollback script is written in execution order, and rollback runs
/// steps in reverse, so rollback statement `k` belongs to apply statement
/// `n-1-k`. When the counts differ the whole rollback script attaches to
/// the final step.
fn pair_steps(
    apply: Vec<String>,
    rollback: Vec<String>,
    ignore_errors: IgnoreErrors,
) -> Vec<Step> {
    let n = apply.len();
    let mut rollback_for: Vec<Option<String>> = vec![None; n];

    if rollback.len() == n {
        for (k, statement) in rollback.into_iter().enumerate() {
            rollback_for[n - 1 - k] = Some(statement);
        }
    } else if !rollback.is_empty() {
        tracing::debug!(
            "rollback script has {} statements for {} apply statements; \
             attaching it to the final step",
            rollback.len(),
            n
        );
        rollback_for[n - 1] = Some(rollback.join(";\n"));
    }

    apply
        .into_iter()
        .zip(rollback_for)
        .map(|(apply, rollback)| {
            Step::Sql {
                apply,
                rollback,
                ignore_errors,
            }
        })
        .collect()
}

struct Header {
    depends: Vec<String>,
    ignore_errors: IgnoreErrors,
    transactional: bool,
    metadata: MigrationMetadata,
}

/// The `-- key: value` pairs of a script's leading comment block.
///
/// Blank lines are skipped, iteration stops at the first line that is
/// neither blank nor a comment, and comment lines without a `:` are plain
/// comments. Every consumer of the header grammar goes through this one
/// tokenizer.
fn header_pairs(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map_while(|line| line.strip_prefix("--"))
        .filter_map(|comment| {
            let (key, value) = comment.split_once(':')?;
            Some((key.trim(), value.trim()))
        })
}

/// The `depends:` identities declared in a script's header.
fn header_depends(content: &str) -> Vec<String> {
    let mut depends = Vec::new();
    for (key, value) in header_pairs(content) {
        if key == "depends" {
            depends.extend(value.split_whitespace().map(String::from));
        }
    }
    depends
}

/// Identity and declared dependencies of every apply script in a directory,
/// read from the header comments only.
///
/// Unlike [`read_migrations`] this tolerates scripts that have no
/// statements yet, so scaffolding can chain onto half-written migrations.
pub fn scan_depends(dir: &Path) -> Result<Vec<(String, Vec<String>)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !is_apply_script(&path) {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            continue;
        }
        let content = std::fs::read_to_string(&path)?;
        out.push((id, header_depends(&content)));
    }
    Ok(out)
}

/// Parses the `-- key: value` comment lines at the top of a script.
fn parse_header(content: &str, path: &Path) -> Result<Header> {
    let mut header = Header {
        depends: Vec::new(),
        ignore_errors: IgnoreErrors::None,
        transactional: true,
        metadata: MigrationMetadata::default(),
    };

    for (key, value) in header_pairs(content) {
        match key {
            "depends" => header
                .depends
                .extend(value.split_whitespace().map(String::from)),
            "ignore-errors" => {
                header.ignore_errors = IgnoreErrors::parse(value).ok_or_else(|| {
                    Error::Configuration(format!(
                        "bad ignore-errors value '{value}' in '{}' \
                         (expected none, apply, rollback, or all)",
                        path.display()
                    ))
                })?;
            }
            "transactional" => {
                header.transactional = !matches!(value, "false" | "no" | "0");
            }
            "author" => header.metadata.author = Some(value.to_string()),
            "message" => header.metadata.message = Some(value.to_string()),
            "created" => match DateTime::parse_from_rfc3339(value) {
                Ok(ts) => header.metadata.created = Some(ts.to_utc()),
                Err(e) => tracing::debug!("unparseable created header in {path:?}: {e}"),
            },
            // Any other comment is just a comment.
            _ => {}
        }
    }

    Ok(header)
}

#[derive(Clone, Copy, PartialEq)]
enum SplitState {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    Dollar,
}

/// Splits a script into statements on top-level `;`.
///
/// Tracks single/double quotes, `--` line comments, nested `/* */` block
/// comments, and dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`).
/// Fragments with no content outside comments are dropped; a trailing
/// statement without a terminating `;` is kept.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut state = SplitState::Normal;
    let mut block_depth = 0usize;
    let mut dollar_tag = String::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let rest = &sql[i..];
        match state {
            SplitState::Normal => {
                if rest.starts_with("--") {
                    state = SplitState::LineComment;
                    i += 2;
                } else if rest.starts_with("/*") {
                    state = SplitState::BlockComment;
                    block_depth = 1;
                    i += 2;
                } else if rest.starts_with('\'') {
                    state = SplitState::SingleQuote;
                    i += 1;
                } else if rest.starts_with('"') {
                    state = SplitState::DoubleQuote;
                    i += 1;
                } else if let Some(tag) = dollar_tag_at(rest) {
                    state = SplitState::Dollar;
                    i += tag.len();
                    dollar_tag = tag;
                } else if rest.starts_with(';') {
                    push_statement(&mut statements, &sql[start..i]);
                    i += 1;
                    start = i;
                } else {
                    i += next_char_len(rest);
                }
            }
            SplitState::SingleQuote => {
                if rest.starts_with("''") {
                    i += 2;
                } else if rest.starts_with('\'') {
                    state = SplitState::Normal;
                    i += 1;
                } else {
                    i += next_char_len(rest);
                }
            }
            SplitState::DoubleQuote => {
                if rest.starts_with("\"\"") {
                    i += 2;
                } else if rest.starts_with('"') {
                    state = SplitState::Normal;
                    i += 1;
                } else {
                    i += next_char_len(rest);
                }
            }
            SplitState::LineComment => {
                if rest.starts_with('\n') {
                    state = SplitState::Normal;
                }
                i += next_char_len(rest);
            }
            SplitState::BlockComment => {
                if rest.starts_with("/*") {
                    block_depth += 1;
                    i += 2;
                } else if rest.starts_with("*/") {
                    block_depth -= 1;
                    if block_depth == 0 {
                        state = SplitState::Normal;
                    }
                    i += 2;
                } else {
                    i += next_char_len(rest);
                }
            }
            SplitState::Dollar => {
                if rest.starts_with(dollar_tag.as_str()) {
                    i += dollar_tag.len();
                    state = SplitState::Normal;
                } else {
                    i += next_char_len(rest);
                }
            }
        }
    }
    push_statement(&mut statements, &sql[start..]);
    statements
}

fn next_char_len(s: &str) -> usize {
    s.chars().next().map_or(1, char::len_utf8)
}

/// Recognizes a dollar-quote delimiter (`$$` or `$tag$`) at the start of
/// the input and returns it.
fn dollar_tag_at(s: &str) -> Option<String> {
    let mut chars = s.chars();
    if chars.next() != Some('$') {
        return None;
    }
    let mut tag = String::from("$");
    for c in chars {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        if c.is_alphanumeric() || c == '_' {
            tag.push(c);
        } else {
            return None;
        }
    }
    None
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && statement_has_content(trimmed) {
        statements.push(trimmed.to_string());
    }
}

/// Whether a fragment contains anything besides whitespace and comments.
fn statement_has_content(fragment: &str) -> bool {
    let mut state = SplitState::Normal;
    let mut block_depth = 0usize;
    let mut i = 0usize;
    let bytes = fragment.as_bytes();

    while i < bytes.len() {
        let rest = &fragment[i..];
        match state {
            SplitState::Normal => {
                if rest.starts_with("--") {
                    state = SplitState::LineComment;
                    i += 2;
                } else if rest.starts_with("/*") {
                    state = SplitState::BlockComment;
                    block_depth = 1;
                    i += 2;
                } else {
                    let c = rest.chars().next().unwrap_or(' ');
                    if !c.is_whitespace() {
                        return true;
                    }
                    i += next_char_len(rest);
                }
            }
            SplitState::LineComment => {
                if rest.starts_with('\n') {
                    state = SplitState::Normal;
                }
                i += next_char_len(rest);
            }
            SplitState::BlockComment => {
                if rest.starts_with("/*") {
                    block_depth += 1;
                    i += 2;
                } else if rest.starts_with("*/") {
                    block_depth -= 1;
                    if block_depth == 0 {
                        state = SplitState::Normal;
                    }
                    i += 2;
                } else {
                    i += next_char_len(rest);
                }
            }
            _ => return true,
        }
    }
    false
}
