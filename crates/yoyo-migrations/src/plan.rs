//! Plan building: turning an operation request into an ordered sequence of
//! (migration, direction) pairs.
//!
//! The resolver combines three inputs: the dependency graph, the applied-set
//! read from the backend, and the requested operation with its optional
//! target revision. The output [`Plan`] is valid by construction — forward
//! plans list every dependency before its dependents (or the dependency is
//! already applied), backward plans the reverse.

use std::collections::HashSet;

use yoyo_core::{Direction, Error, Result};

use crate::graph::DependencyGraph;

/// The operations the resolver can plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Apply unapplied migrations.
    Apply,
    /// Roll back applied migrations.
    Rollback,
    /// Roll back then re-apply the selected migrations.
    Reapply,
    /// Record migrations as applied without running their steps.
    Mark,
    /// Remove applied-set records without running rollback steps.
    Unmark,
}

/// One entry of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanItem {
    /// Arena index of the migration in the graph.
    pub index: usize,
    /// Which way the migration is driven.
    pub direction: Direction,
    /// When set, the executor only mutates the applied-set; step bodies
    /// and savepoints are skipped.
    pub mark_only: bool,
}

/// An ordered sequence of plan items, executed left to right.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// The items, in execution order.
    pub items: Vec<PlanItem>,
}

impl Plan {
    /// Whether the plan contains no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items in the plan.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Truncates the plan to its first `n` items.
    pub fn truncate(&mut self, n: usize) {
        self.items.truncate(n);
    }
}

/// Builds the plan for `op` against the current applied-set.
///
/// `target` narrows the operation to one revision and its transitive
/// closure: ancestors for forward operations, descendants for backward
/// ones. `force` permits a full rollback to skip applied identities whose
/// definitions are no longer present instead of failing.
pub fn build_plan(
    graph: &DependencyGraph,
    applied: &HashSet<String>,
    op: Operation,
    target: Option<&str>,
    force: bool,
) -> Result<Plan> {
    let order = graph.topo_order()?;

    let items = match op {
        Operation::Apply | Operation::Mark => {
            check_applied_consistency(graph, applied)?;
            forward_items(graph, &order, applied, target, op == Operation::Mark)?
        }
        Operation::Rollback | Operation::Unmark => backward_items(
            graph,
            &order,
            applied,
            target,
            force,
            op == Operation::Unmark,
        )?,
        Operation::Reapply => {
            check_applied_consistency(graph, applied)?;
            let selection = backward_selection(graph, target)?;
            let mut items = Vec::new();
            // Backward over the restricted applied set...
            for &i in order.iter().rev() {
                if selection.as_ref().map_or(true, |s| s.contains(&i))
                    && applied.contains(&graph.migration(i).id)
                {
                    items.push(PlanItem {
                        index: i,
                        direction: Direction::Backward,
                        mark_only: false,
                    });
                }
            }
            // ...then forward over the same set.
            for &i in &order {
                if selection.as_ref().map_or(true, |s| s.contains(&i))
                    && applied.contains(&graph.migration(i).id)
                {
                    items.push(PlanItem {
                        index: i,
                        direction: Direction::Forward,
                        mark_only: false,
                    });
                }
            }
            items
        }
    };

    Ok(Plan { items })
}

/// Selection for forward operations: the target and its transitive
/// dependencies, or everything when no target is given.
fn forward_selection(
    graph: &DependencyGraph,
    target: Option<&str>,
) -> Result<Option<HashSet<usize>>> {
    target
        .map(|t| {
            let index = resolve_target(graph, t)?;
            let mut selection = graph.ancestors(index);
            selection.insert(index);
            Ok(selection)
        })
        .transpose()
}

/// Selection for backward operations: the target and its transitive
/// dependents, or everything when no target is given.
fn backward_selection(
    graph: &DependencyGraph,
    target: Option<&str>,
) -> Result<Option<HashSet<usize>>> {
    target
        .map(|t| {
            let index = resolve_target(graph, t)?;
            let mut selection = graph.descendants(index);
            selection.insert(index);
            Ok(selection)
        })
        .transpose()
}

fn resolve_target(graph: &DependencyGraph, target: &str) -> Result<usize> {
    graph.index_of(target).ok_or_else(|| {
        Error::Resolution(format!(
            "target migration '{target}' not found in the migration sources"
        ))
    })
}

fn forward_items(
    graph: &DependencyGraph,
    order: &[usize],
    applied: &HashSet<String>,
    target: Option<&str>,
    mark_only: bool,
) -> Result<Vec<PlanItem>> {
    let selection = forward_selection(graph, target)?;
    Ok(order
        .iter()
        .filter(|&&i| selection.as_ref().map_or(true, |s| s.contains(&i)))
        .filter(|&&i| !applied.contains(&graph.migration(i).id))
        .map(|&i| PlanItem {
            index: i,
            direction: Direction::Forward,
            mark_only,
        })
        .collect())
}

fn backward_items(
    graph: &DependencyGraph,
    order: &[usize],
    applied: &HashSet<String>,
    target: Option<&str>,
    force: bool,
    mark_only: bool,
) -> Result<Vec<PlanItem>> {
    if let Some(t) = target {
        if graph.index_of(t).is_none() && applied.contains(t) {
            return Err(Error::Resolution(format!(
                "migration '{t}' is recorded as applied but its definition is not \
                 available; it cannot be rolled back"
            )));
        }
    } else {
        // A full rollback would have to roll back every applied migration,
        // including ones whose definitions are gone.
        let mut stale: Vec<&str> = applied
            .iter()
            .filter(|id| graph.index_of(id).is_none())
            .map(String::as_str)
            .collect();
        stale.sort_unstable();
        if !stale.is_empty() {
            if force {
                tracing::warn!(
                    "skipping applied migrations with no available definition: {}",
                    stale.join(", ")
                );
            } else {
                return Err(Error::Resolution(format!(
                    "applied migrations with no available definition cannot be rolled \
                     back: {} (pass force to skip them)",
                    stale.join(", ")
                )));
            }
        }
    }

    let selection = backward_selection(graph, target)?;
    Ok(order
        .iter()
        .rev()
        .filter(|&&i| selection.as_ref().map_or(true, |s| s.contains(&i)))
        .filter(|&&i| applied.contains(&graph.migration(i).id))
        .map(|&i| PlanItem {
            index: i,
            direction: Direction::Backward,
            mark_only,
        })
        .collect())
}

/// Rejects an applied-set that contradicts the dependency closure: a
/// migration recorded as applied whose dependency is not applied means the
/// database was manually intervened on, and no forward plan over it is
/// trustworthy.
fn check_applied_consistency(graph: &DependencyGraph, applied: &HashSet<String>) -> Result<()> {
    for i in 0..graph.len() {
        let migration = graph.migration(i);
        if !applied.contains(&migration.id) {
            continue;
        }
        for dep in &migration.depends {
            if !applied.contains(dep) {
                return Err(Error::Resolution(format!(
                    "applied migration '{}' depends on '{dep}', which is not applied; \
                     the applied-set contradicts the dependency graph",
                    migration.id
                )));
            }
        }
    }
    Ok(())
}
