//! The migration object model.
//!
//! A [`Migration`] is an identity, an ordered list of [`Step`]s, and the
//! identities it depends on. The model is read-only once constructed: source
//! discovery (or test code) builds migrations with the builder methods, and
//! everything downstream — graph, plan, executor — only borrows them.
//!
//! A [`Step`] is the smallest executable unit: a SQL statement pair, an
//! opaque callable receiving the live backend, or a group of child steps
//! sharing one savepoint. Every step carries an [`IgnoreErrors`] policy.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use yoyo_backends::MigrationBackend;
use yoyo_core::{Direction, Error, Result};

/// Identity reserved for the post-apply hook migration. It is segregated
/// from the normal set, never ordered into a plan, and never recorded in
/// the applied-set.
pub const POST_APPLY_ID: &str = "post-apply";

/// Which directions of a step may fail without aborting the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreErrors {
    /// Errors always abort.
    #[default]
    None,
    /// Errors are ignored while applying.
    Apply,
    /// Errors are ignored while rolling back.
    Rollback,
    /// Errors are ignored in both directions.
    All,
}

impl IgnoreErrors {
    /// Whether this policy suppresses errors in the given direction.
    pub fn covers(self, direction: Direction) -> bool {
        match self {
            Self::None => false,
            Self::Apply => direction == Direction::Forward,
            Self::Rollback => direction == Direction::Backward,
            Self::All => true,
        }
    }

    /// Parses the policy name used in migration file headers.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(Self::None),
            "apply" => Some(Self::Apply),
            "rollback" => Some(Self::Rollback),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// The future a callable step returns.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A callable step body: receives the live backend for the duration of the
/// call and must not close it.
pub type StepFn = Arc<dyn for<'a> Fn(&'a dyn MigrationBackend) -> StepFuture<'a> + Send + Sync>;

/// The smallest executable unit within a migration.
#[derive(Clone)]
pub enum Step {
    /// A literal SQL statement pair.
    Sql {
        /// Statement run when applying.
        apply: String,
        /// Statement run when rolling back; steps without one are skipped
        /// on rollback.
        rollback: Option<String>,
        /// Error-tolerance policy.
        ignore_errors: IgnoreErrors,
    },
    /// An opaque operation over the live connection.
    Callable {
        /// Invoked when applying.
        apply: StepFn,
        /// Invoked when rolling back, if present.
        rollback: Option<StepFn>,
        /// Error-tolerance policy.
        ignore_errors: IgnoreErrors,
    },
    /// An ordered sequence of child steps sharing a single savepoint.
    Group {
        /// The child steps, run in order (reversed when rolling back).
        children: Vec<Step>,
        /// Policy applied when an uncovered child error reaches the group.
        ignore_errors: IgnoreErrors,
    },
}

impl Step {
    /// A SQL step with no rollback statement.
    pub fn sql(apply: impl Into<String>) -> Self {
        Self::Sql {
            apply: apply.into(),
            rollback: None,
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// A SQL step with apply and rollback statements.
    pub fn sql_with_rollback(apply: impl Into<String>, rollback: impl Into<String>) -> Self {
        Self::Sql {
            apply: apply.into(),
            rollback: Some(rollback.into()),
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// A callable step with no rollback.
    pub fn callable(apply: StepFn) -> Self {
        Self::Callable {
            apply,
            rollback: None,
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// A callable step with apply and rollback bodies.
    pub fn callable_with_rollback(apply: StepFn, rollback: StepFn) -> Self {
        Self::Callable {
            apply,
            rollback: Some(rollback),
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// A group of child steps sharing one savepoint.
    pub fn group(children: Vec<Step>) -> Self {
        Self::Group {
            children,
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// Sets the step's error-tolerance policy.
    pub fn ignore_errors(mut self, policy: IgnoreErrors) -> Self {
        match &mut self {
            Self::Sql { ignore_errors, .. }
            | Self::Callable { ignore_errors, .. }
            | Self::Group { ignore_errors, .. } => *ignore_errors = policy,
        }
        self
    }

    /// Returns the step's error-tolerance policy.
    pub fn ignore_policy(&self) -> IgnoreErrors {
        match self {
            Self::Sql { ignore_errors, .. }
            | Self::Callable { ignore_errors, .. }
            | Self::Group { ignore_errors, .. } => *ignore_errors,
        }
    }

    /// A short description used in logs and non-transactional diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Sql { apply, .. } => {
                let head: String = apply.split_whitespace().collect::<Vec<_>>().join(" ");
                if head.chars().count() > 60 {
                    let truncated: String = head.chars().take(60).collect();
                    format!("{truncated}…")
                } else {
                    head
                }
            }
            Self::Callable { .. } => "<callable>".to_string(),
            Self::Group { children, .. } => format!("group of {} steps", children.len()),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql {
                apply,
                rollback,
                ignore_errors,
            } => f
                .debug_struct("Sql")
                .field("apply", apply)
                .field("rollback", rollback)
                .field("ignore_errors", ignore_errors)
                .finish(),
            Self::Callable {
                rollback,
                ignore_errors,
                ..
            } => f
                .debug_struct("Callable")
                .field("has_rollback", &rollback.is_some())
                .field("ignore_errors", ignore_errors)
                .finish(),
            Self::Group {
                children,
                ignore_errors,
            } => f
                .debug_struct("Group")
                .field("children", children)
                .field("ignore_errors", ignore_errors)
                .finish(),
        }
    }
}

/// Free-form information carried by a migration's source header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationMetadata {
    /// Author named in the source header.
    pub author: Option<String>,
    /// Creation timestamp from the source header.
    pub created: Option<DateTime<Utc>>,
    /// One-line description from the source header.
    pub message: Option<String>,
}

/// A single migration: identity, ordered steps, declared dependencies.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique identity, typically the script filename without extension.
    pub id: String,
    /// The steps, in apply order.
    pub steps: Vec<Step>,
    /// Identities this migration depends on.
    pub depends: Vec<String>,
    /// The script path this migration was loaded from, if any.
    pub source: Option<PathBuf>,
    /// Header metadata.
    pub metadata: MigrationMetadata,
    /// When false, the executor drives this migration without an outer
    /// transaction or savepoints (for scripts that manage their own
    /// transaction state, e.g. CREATE INDEX CONCURRENTLY).
    pub transactional: bool,
}

impl Migration {
    /// Creates an empty migration with the given identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            depends: Vec::new(),
            source: None,
            metadata: MigrationMetadata::default(),
            transactional: true,
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a dependency on another migration.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends.push(id.into());
        self
    }

    /// Records the source path.
    pub fn from_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Sets whether the executor wraps this migration in a transaction.
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Whether this is the post-apply hook migration.
    pub fn is_post_apply(&self) -> bool {
        self.id == POST_APPLY_ID
    }
}

/// The collection source discovery yields: the normal migrations plus the
/// segregated post-apply hook.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
    post_apply: Option<Migration>,
}

impl MigrationSet {
    /// Builds a set, segregating the post-apply migration and rejecting
    /// duplicate identities.
    pub fn new(all: Vec<Migration>) -> Result<Self> {
        let mut migrations = Vec::new();
        let mut post_apply = None;
        let mut seen: std::collections::HashMap<String, Option<PathBuf>> =
            std::collections::HashMap::new();

        for migration in all {
            if let Some(previous) = seen.insert(migration.id.clone(), migration.source.clone()) {
                return Err(Error::Resolution(format!(
                    "duplicate migration identity '{}' (first defined in {:?}, again in {:?})",
                    migration.id, previous, migration.source
                )));
            }
            if migration.is_post_apply() {
                post_apply = Some(migration);
            } else {
                migrations.push(migration);
            }
        }

        Ok(Self {
            migrations,
            post_apply,
        })
    }

    /// The normal migrations, in discovery order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// The segregated post-apply hook, if any.
    pub fn post_apply(&self) -> Option<&Migration> {
        self.post_apply.as_ref()
    }

    /// Looks up a migration by identity.
    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == id)
    }

    /// Number of normal migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether the set holds no normal migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_errors_covers() {
        assert!(!IgnoreErrors::None.covers(Direction::Forward));
        assert!(!IgnoreErrors::None.covers(Direction::Backward));
        assert!(IgnoreErrors::Apply.covers(Direction::Forward));
        assert!(!IgnoreErrors::Apply.covers(Direction::Backward));
        assert!(!IgnoreErrors::Rollback.covers(Direction::Forward));
        assert!(IgnoreErrors::Rollback.covers(Direction::Backward));
        assert!(IgnoreErrors::All.covers(Direction::Forward));
        assert!(IgnoreErrors::All.covers(Direction::Backward));
    }

    #[test]
    fn test_ignore_errors_parse() {
        assert_eq!(IgnoreErrors::parse("apply"), Some(IgnoreErrors::Apply));
        assert_eq!(IgnoreErrors::parse(" all "), Some(IgnoreErrors::All));
        assert_eq!(IgnoreErrors::parse("sometimes"), None);
    }

    #[test]
    fn test_step_builders() {
        let step = Step::sql_with_rollback("CREATE TABLE t (x)", "DROP TABLE t")
            .ignore_errors(IgnoreErrors::Apply);
        assert_eq!(step.ignore_policy(), IgnoreErrors::Apply);
        match step {
            Step::Sql { apply, rollback, .. } => {
                assert_eq!(apply, "CREATE TABLE t (x)");
                assert_eq!(rollback.as_deref(), Some("DROP TABLE t"));
            }
            _ => panic!("expected SQL step"),
        }
    }

    #[test]
    fn test_step_describe_truncates() {
        let long = format!("SELECT {}", "x, ".repeat(60));
        let step = Step::sql(long);
        assert!(step.describe().len() <= 64);
    }

    #[test]
    fn test_migration_builder() {
        let m = Migration::new("0002_users")
            .depends_on("0001_initial")
            .with_step(Step::sql("CREATE TABLE users (id INT)"))
            .transactional(false);
        assert_eq!(m.id, "0002_users");
        assert_eq!(m.depends, vec!["0001_initial"]);
        assert_eq!(m.steps.len(), 1);
        assert!(!m.transactional);
        assert!(!m.is_post_apply());
    }

    #[test]
    fn test_set_segregates_post_apply() {
        let set = MigrationSet::new(vec![
            Migration::new("0001_initial"),
            Migration::new(POST_APPLY_ID).with_step(Step::sql("GRANT ALL ON t TO app")),
        ])
        .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.post_apply().is_some());
        assert!(set.get(POST_APPLY_ID).is_none());
    }

    #[test]
    fn test_set_rejects_duplicates() {
        let err = MigrationSet::new(vec![
            Migration::new("0001_initial"),
            Migration::new("0001_initial"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
        assert!(err.to_string().contains("0001_initial"));
    }
}
