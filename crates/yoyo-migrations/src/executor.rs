//! Plan execution: the two-level transaction state machine.
//!
//! The [`Executor`] drives a [`Plan`] against a backend. Per migration it
//! opens an outer transaction; per top-level step it opens a savepoint named
//! from a monotonic counter. A step failure covered by the step's
//! `ignore_errors` policy rolls back to the savepoint and execution
//! continues; an uncovered failure rolls back the whole outer transaction
//! and aborts the plan. The applied-set mutation happens inside the outer
//! transaction, so "steps ran" and "recorded as applied" commit atomically
//! on backends with transactional DDL.
//!
//! The cross-process advisory lock brackets the entire run: acquired before
//! the applied-set is read, released on every exit path.

use std::collections::HashSet;

use chrono::Utc;

use yoyo_backends::MigrationBackend;
use yoyo_core::{
    CancellationToken, ConfirmFn, Decision, Direction, Error, MigrationConfig, Result,
};

use crate::graph::DependencyGraph;
use crate::migration::{Migration, Step, StepFuture};
use crate::plan::{build_plan, Operation, Plan};

/// Lifecycle of one migration within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationState {
    Pending,
    Running,
    Committed,
    Aborted,
}

/// What a run did, by migration identity.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Migrations applied forward (steps ran and row recorded).
    pub applied: Vec<String>,
    /// Migrations rolled back (steps ran and row removed).
    pub rolled_back: Vec<String>,
    /// Migrations recorded without running steps.
    pub marked: Vec<String>,
    /// Migrations unrecorded without running steps.
    pub unmarked: Vec<String>,
    /// Migrations skipped by the interactive confirmation callback.
    pub skipped: Vec<String>,
    /// Migrations that aborted while `continue_on_failure` was set.
    pub failed: Vec<String>,
    /// Whether the post-apply hook ran.
    pub post_apply_ran: bool,
}

/// Drives plans against a backend.
pub struct Executor<'a> {
    backend: &'a dyn MigrationBackend,
    config: &'a MigrationConfig,
    confirm: Option<ConfirmFn>,
    cancel: Option<CancellationToken>,
    post_apply: bool,
    limit: Option<usize>,
}

impl<'a> Executor<'a> {
    /// Creates an executor over a backend and configuration.
    pub fn new(backend: &'a dyn MigrationBackend, config: &'a MigrationConfig) -> Self {
        Self {
            backend,
            config,
            confirm: None,
            cancel: None,
            post_apply: true,
            limit: None,
        }
    }

    /// Installs the interactive confirmation callback. It is only consulted
    /// when the configuration has batch mode off.
    pub fn with_confirm(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = Some(confirm);
        self
    }

    /// Installs a cancellation token checked between steps and migrations.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Enables or disables the post-apply hook for this executor.
    pub fn with_post_apply(mut self, enabled: bool) -> Self {
        self.post_apply = enabled;
        self
    }

    /// Caps the plan at its first `n` items.
    pub fn with_limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Plans and executes `op` end to end: takes the advisory lock, reads
    /// the applied-set, builds the plan, runs it, and releases the lock on
    /// every exit path.
    pub async fn run_operation(
        &self,
        graph: &DependencyGraph,
        op: Operation,
        target: Option<&str>,
        force: bool,
    ) -> Result<ExecutionReport> {
        self.backend.ensure_internal_tables().await?;
        self.backend.lock(self.config.lock_timeout).await?;

        let result = self.locked_run(graph, op, target, force).await;

        if let Err(e) = self.backend.unlock().await {
            tracing::warn!("failed to release migration lock: {e}");
        }
        result
    }

    async fn locked_run(
        &self,
        graph: &DependencyGraph,
        op: Operation,
        target: Option<&str>,
        force: bool,
    ) -> Result<ExecutionReport> {
        // The lock is already held, so this read cannot race another
        // migrator's commits.
        let applied: HashSet<String> = self
            .backend
            .list_applied()
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        let mut plan = build_plan(graph, &applied, op, target, force)?;
        if let Some(limit) = self.limit {
            plan.truncate(limit);
        }
        self.run_plan(graph, &plan).await
    }

    /// Executes an already-built plan. Assumes the advisory lock is held.
    async fn run_plan(&self, graph: &DependencyGraph, plan: &Plan) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        if plan.is_empty() {
            tracing::info!("nothing to do");
            return Ok(report);
        }

        if self.backend.disable_transactions() {
            tracing::warn!(
                "backend '{}' cannot roll back DDL; a failing migration may leave \
                 the schema partially migrated",
                self.backend.vendor()
            );
        }

        let mut ask = !self.config.batch_mode && self.confirm.is_some();
        let mut quit = false;

        for item in &plan.items {
            self.check_cancelled()?;
            let migration = graph.migration(item.index);

            if ask {
                if let Some(confirm) = &self.confirm {
                    match confirm(&migration.id, item.direction) {
                        Decision::Yes => {}
                        Decision::No => {
                            tracing::info!("skipping '{}'", migration.id);
                            report.skipped.push(migration.id.clone());
                            continue;
                        }
                        Decision::All => ask = false,
                        Decision::Quit => {
                            tracing::info!("stopping at user request");
                            quit = true;
                            break;
                        }
                    }
                }
            }

            match self
                .run_migration(migration, item.direction, item.mark_only, true)
                .await
            {
                Ok(()) => {
                    let bucket = match (item.direction, item.mark_only) {
                        (Direction::Forward, false) => &mut report.applied,
                        (Direction::Backward, false) => &mut report.rolled_back,
                        (Direction::Forward, true) => &mut report.marked,
                        (Direction::Backward, true) => &mut report.unmarked,
                    };
                    bucket.push(migration.id.clone());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if self.config.continue_on_failure => {
                    tracing::error!("{e}; continuing with the remaining plan");
                    report.failed.push(migration.id.clone());
                }
                Err(e) => return Err(e),
            }
        }

        // The hook only fires after a plan that ran to completion.
        if self.post_apply && !quit && !report.applied.is_empty() {
            if let Some(hook) = graph.post_apply() {
                tracing::info!("running post-apply hook");
                self.run_migration(hook, Direction::Forward, false, false)
                    .await?;
                report.post_apply_ran = true;
            }
        }

        Ok(report)
    }

    /// Runs a single migration under the outer transaction. `record`
    /// controls the applied-set mutation; the post-apply hook runs with it
    /// off.
    async fn run_migration(
        &self,
        migration: &Migration,
        direction: Direction,
        mark_only: bool,
        record: bool,
    ) -> Result<()> {
        let mut state = MigrationState::Pending;
        tracing::debug!("migration '{}' -> {state:?}", migration.id);

        state = MigrationState::Running;
        tracing::debug!("migration '{}' -> {state:?}", migration.id);
        tracing::info!("{} '{}'", direction.verb(), migration.id);

        let transactional = migration.transactional;
        if transactional {
            self.backend.begin().await?;
        }

        let outcome = self
            .drive_steps(migration, direction, mark_only, record)
            .await;

        match outcome {
            Ok(()) => {
                if transactional {
                    // A commit failure is fatal and surfaced without retry.
                    self.backend.commit().await?;
                }
                state = MigrationState::Committed;
                tracing::debug!("migration '{}' -> {state:?}", migration.id);
                Ok(())
            }
            Err(e) => {
                if transactional {
                    if let Err(rollback_err) = self.backend.rollback().await {
                        tracing::warn!(
                            "rollback after failed migration '{}' also failed: {rollback_err}",
                            migration.id
                        );
                    }
                }
                state = MigrationState::Aborted;
                tracing::debug!("migration '{}' -> {state:?}", migration.id);
                Err(e)
            }
        }
    }

    async fn drive_steps(
        &self,
        migration: &Migration,
        direction: Direction,
        mark_only: bool,
        record: bool,
    ) -> Result<()> {
        if !mark_only {
            let steps: Vec<&Step> = match direction {
                Direction::Forward => migration.steps.iter().collect(),
                Direction::Backward => migration.steps.iter().rev().collect(),
            };

            let mut counter = 0usize;
            let mut ran: Vec<String> = Vec::new();
            for step in steps {
                self.check_cancelled()?;
                if let Err(e) = self.run_step(migration, step, direction, &mut counter).await {
                    let unrecoverable =
                        self.backend.disable_transactions() || !migration.transactional;
                    if unrecoverable && !ran.is_empty() {
                        tracing::warn!(
                            "migration '{}' failed after these steps ran and cannot be \
                             rolled back: {}",
                            migration.id,
                            ran.join("; ")
                        );
                    }
                    return Err(e);
                }
                ran.push(step.describe());
            }
        }

        if record {
            self.mutate_applied(migration, direction).await?;
        }
        Ok(())
    }

    async fn mutate_applied(&self, migration: &Migration, direction: Direction) -> Result<()> {
        match direction {
            Direction::Forward => {
                match self.backend.record_applied(&migration.id, Utc::now()).await {
                    // A concurrent migrator got there first; its row stands.
                    Err(Error::Integrity(message)) => {
                        tracing::warn!("skipping applied-set insert: {message}");
                        Ok(())
                    }
                    other => other,
                }
            }
            Direction::Backward => self.backend.unrecord_applied(&migration.id).await,
        }
    }

    /// Runs one top-level step under its own savepoint.
    async fn run_step(
        &self,
        migration: &Migration,
        step: &Step,
        direction: Direction,
        counter: &mut usize,
    ) -> Result<()> {
        let transactional = migration.transactional;
        let savepoint = format!("yoyo_sp_{}", *counter);
        *counter += 1;

        if transactional {
            self.backend.savepoint(&savepoint).await?;
        }

        match self.step_body(step, direction).await {
            Ok(()) => {
                if transactional {
                    self.backend.release_savepoint(&savepoint).await?;
                }
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                if step.ignore_policy().covers(direction) {
                    if transactional {
                        self.backend.rollback_to_savepoint(&savepoint).await?;
                    }
                    tracing::warn!("ignoring error in step ({}): {e}", step.describe());
                    Ok(())
                } else {
                    Err(Error::step(&migration.id, direction, e.to_string()))
                }
            }
        }
    }

    /// Executes a step body. Group children run in order (reversed when
    /// rolling back) inside the group's single savepoint: a child error the
    /// child's own policy covers is logged and skipped; anything else
    /// bubbles to the group.
    fn step_body<'s>(&'s self, step: &'s Step, direction: Direction) -> StepFuture<'s> {
        Box::pin(async move {
            match step {
                Step::Sql {
                    apply, rollback, ..
                } => {
                    let statement = match direction {
                        Direction::Forward => Some(apply.as_str()),
                        Direction::Backward => rollback.as_deref(),
                    };
                    match statement {
                        Some(sql) => {
                            self.backend.execute(sql, &[]).await?;
                            Ok(())
                        }
                        None => {
                            tracing::debug!("step has no rollback statement; skipping");
                            Ok(())
                        }
                    }
                }
                Step::Callable {
                    apply, rollback, ..
                } => {
                    let body = match direction {
                        Direction::Forward => Some(apply),
                        Direction::Backward => rollback.as_ref(),
                    };
                    match body {
                        Some(body) => body(self.backend).await,
                        None => {
                            tracing::debug!("step has no rollback body; skipping");
                            Ok(())
                        }
                    }
                }
                Step::Group { children, .. } => {
                    let ordered: Vec<&Step> = match direction {
                        Direction::Forward => children.iter().collect(),
                        Direction::Backward => children.iter().rev().collect(),
                    };
                    for child in ordered {
                        if let Err(e) = self.step_body(child, direction).await {
                            if child.ignore_policy().covers(direction)
                                && !matches!(e, Error::Cancelled)
                            {
                                tracing::warn!(
                                    "ignoring error in grouped step ({}): {e}",
                                    child.describe()
                                );
                            } else {
                                return Err(e);
                            }
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}
