//! # yoyo-migrations
//!
//! The yoyo migration engine: object model, dependency graph, plan
//! resolution, and the two-level transaction executor.
//!
//! ## Architecture
//!
//! - [`Migration`] / [`Step`] — the read-only object model source discovery
//!   yields.
//! - [`DependencyGraph`] — arena-backed DAG with deterministic topological
//!   ordering.
//! - [`plan::build_plan`] — turns (graph, applied-set, operation, target)
//!   into an ordered [`Plan`].
//! - [`Executor`] — drives a plan: advisory lock, outer transaction per
//!   migration, savepoint per step, applied-set mutation, post-apply hook.
//! - [`sources::read_migrations`] — loads SQL scripts from source
//!   directories.
//!
//! ## The programmatic façade
//!
//! The free functions at the crate root are the stable interface:
//! [`read_migrations`], [`get_backend`], [`apply_migrations`],
//! [`apply_migrations_only`], [`rollback_migrations`], [`rollback_one`],
//! [`mark_migrations`], [`unmark_migrations`].
//!
//! ```no_run
//! # async fn demo() -> yoyo_core::Result<()> {
//! use std::path::PathBuf;
//! use yoyo_core::MigrationConfig;
//!
//! let config = MigrationConfig::default();
//! let set = yoyo_migrations::read_migrations(&[PathBuf::from("migrations")])?;
//! let backend = yoyo_migrations::get_backend("sqlite:///app.db", &config).await?;
//! yoyo_migrations::apply_migrations(backend.as_ref(), &set, None, false, &config).await?;
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod graph;
pub mod migration;
pub mod plan;
pub mod sources;

pub use executor::{ExecutionReport, Executor};
pub use graph::DependencyGraph;
pub use migration::{
    IgnoreErrors, Migration, MigrationMetadata, MigrationSet, Step, StepFn, StepFuture,
    POST_APPLY_ID,
};
pub use plan::{build_plan, Operation, Plan, PlanItem};
pub use sources::read_migrations;

pub use yoyo_backends::MigrationBackend;
pub use yoyo_core::{
    CancellationToken, ConfirmFn, Decision, Direction, Error, MigrationConfig, Result,
};

/// Connects to the database addressed by a URI, using the backend registry.
pub async fn get_backend(
    uri: &str,
    config: &MigrationConfig,
) -> Result<Box<dyn MigrationBackend>> {
    yoyo_backends::connect(uri, config).await
}

/// Applies every unapplied migration (optionally narrowed to `target` and
/// its dependencies), then fires the post-apply hook if anything was
/// applied.
pub async fn apply_migrations(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    force: bool,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .run_operation(&graph, Operation::Apply, target, force)
        .await
}

/// Like [`apply_migrations`] but never fires the post-apply hook.
pub async fn apply_migrations_only(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    force: bool,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .with_post_apply(false)
        .run_operation(&graph, Operation::Apply, target, force)
        .await
}

/// Rolls back applied migrations (optionally narrowed to `target` and its
/// dependents).
pub async fn rollback_migrations(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    force: bool,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .run_operation(&graph, Operation::Rollback, target, force)
        .await
}

/// Rolls back exactly the most recently applied migration.
pub async fn rollback_one(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    force: bool,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .with_limit(1)
        .run_operation(&graph, Operation::Rollback, None, force)
        .await
}

/// Rolls back then re-applies the selected migrations. The run ends in a
/// forward phase, so the post-apply hook fires if anything was re-applied.
pub async fn reapply_migrations(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    force: bool,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .run_operation(&graph, Operation::Reapply, target, force)
        .await
}

/// Records migrations as applied without running their steps.
pub async fn mark_migrations(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .run_operation(&graph, Operation::Mark, target, false)
        .await
}

/// Removes applied-set records without running rollback steps.
pub async fn unmark_migrations(
    backend: &dyn MigrationBackend,
    set: &MigrationSet,
    target: Option<&str>,
    config: &MigrationConfig,
) -> Result<ExecutionReport> {
    let graph = DependencyGraph::new(set.clone())?;
    Executor::new(backend, config)
        .run_operation(&graph, Operation::Unmark, target, false)
        .await
}
