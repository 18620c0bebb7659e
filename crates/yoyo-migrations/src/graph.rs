//! The migration dependency graph.
//!
//! [`DependencyGraph`] owns a [`MigrationSet`] in an arena: migrations live
//! in a `Vec`, identities resolve to indices exactly once at construction,
//! and the edge lists hold indices from then on. No cyclic object graphs,
//! no shared ownership.
//!
//! Ordering is Kahn's algorithm over a min-heap keyed on identity, so any
//! two migrations not ordered by the dependency relation come out in
//! lexicographic identity order. This makes plans deterministic: a diamond
//! `A ← {B, C} ← D` always resolves B before C.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use yoyo_core::{Error, Result};

use crate::migration::{Migration, MigrationSet};

/// An immutable dependency DAG over a set of migrations.
#[derive(Debug)]
pub struct DependencyGraph {
    set: MigrationSet,
    index: HashMap<String, usize>,
    /// `deps[i]` — indices of the migrations `i` depends on.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]` — indices of the migrations depending on `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph, resolving dependency identities to indices and
    /// validating that the result is acyclic.
    ///
    /// A dependency on an identity not in the set, and any dependency
    /// cycle, are resolution errors.
    pub fn new(set: MigrationSet) -> Result<Self> {
        let migrations = set.migrations();
        let index: HashMap<String, usize> = migrations
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();

        let mut deps = vec![Vec::new(); migrations.len()];
        let mut dependents = vec![Vec::new(); migrations.len()];

        for (i, migration) in migrations.iter().enumerate() {
            for dep in &migration.depends {
                let Some(&j) = index.get(dep) else {
                    return Err(Error::Resolution(format!(
                        "migration '{}' depends on unknown migration '{dep}'",
                        migration.id
                    )));
                };
                deps[i].push(j);
                dependents[j].push(i);
            }
        }

        let graph = Self {
            set,
            index,
            deps,
            dependents,
        };
        // Surfaces cycles at construction time.
        graph.topo_order()?;
        Ok(graph)
    }

    /// The underlying migration set.
    pub fn set(&self) -> &MigrationSet {
        &self.set
    }

    /// The migration stored at an arena index.
    pub fn migration(&self, index: usize) -> &Migration {
        &self.set.migrations()[index]
    }

    /// Resolves an identity to its arena index.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Number of migrations in the graph.
    pub fn len(&self) -> usize {
        self.set.migrations().len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.set.migrations().is_empty()
    }

    /// The segregated post-apply hook, if any.
    pub fn post_apply(&self) -> Option<&Migration> {
        self.set.post_apply()
    }

    /// All indices in topological order (dependencies first), ties broken
    /// by lexicographic identity order.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let n = self.len();
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();

        // Min-heap on identity: among all currently-unblocked migrations the
        // lexicographically smallest runs next.
        let mut ready: BinaryHeap<Reverse<(&str, usize)>> = BinaryHeap::new();
        for (i, &degree) in in_degree.iter().enumerate() {
            if degree == 0 {
                ready.push(Reverse((self.migration(i).id.as_str(), i)));
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, i))) = ready.pop() {
            order.push(i);
            for &j in &self.dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse((self.migration(j).id.as_str(), j)));
                }
            }
        }

        if order.len() != n {
            let mut cycle: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, &d)| d > 0)
                .map(|(i, _)| self.migration(i).id.as_str())
                .collect();
            cycle.sort_unstable();
            return Err(Error::Resolution(format!(
                "dependency cycle involving: {}",
                cycle.join(", ")
            )));
        }

        Ok(order)
    }

    /// Transitive dependencies of a migration (not including itself).
    pub fn ancestors(&self, index: usize) -> HashSet<usize> {
        self.closure(index, &self.deps)
    }

    /// Transitive dependents of a migration (not including itself).
    pub fn descendants(&self, index: usize) -> HashSet<usize> {
        self.closure(index, &self.dependents)
    }

    fn closure(&self, start: usize, edges: &[Vec<usize>]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = edges[start].clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(edges[i].iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration;

    fn graph(migrations: Vec<Migration>) -> DependencyGraph {
        DependencyGraph::new(MigrationSet::new(migrations).unwrap()).unwrap()
    }

    fn ids(graph: &DependencyGraph, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&i| graph.migration(i).id.clone())
            .collect()
    }

    #[test]
    fn test_empty_graph() {
        let g = graph(vec![]);
        assert!(g.is_empty());
        assert!(g.topo_order().unwrap().is_empty());
    }

    #[test]
    fn test_linear_chain_order() {
        let g = graph(vec![
            Migration::new("003").depends_on("002"),
            Migration::new("001"),
            Migration::new("002").depends_on("001"),
        ]);
        let order = g.topo_order().unwrap();
        assert_eq!(ids(&g, &order), vec!["001", "002", "003"]);
    }

    #[test]
    fn test_diamond_tie_break_is_lexicographic() {
        let g = graph(vec![
            Migration::new("D").depends_on("B").depends_on("C"),
            Migration::new("C").depends_on("A"),
            Migration::new("B").depends_on("A"),
            Migration::new("A"),
        ]);
        let order = g.topo_order().unwrap();
        assert_eq!(ids(&g, &order), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_independent_nodes_sorted() {
        let g = graph(vec![
            Migration::new("c"),
            Migration::new("a"),
            Migration::new("b"),
        ]);
        let order = g.topo_order().unwrap();
        assert_eq!(ids(&g, &order), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unknown_dependency_is_fatal() {
        let err = DependencyGraph::new(
            MigrationSet::new(vec![Migration::new("b").depends_on("missing")]).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_cycle_reported_with_members() {
        let err = DependencyGraph::new(
            MigrationSet::new(vec![
                Migration::new("a").depends_on("b"),
                Migration::new("b").depends_on("a"),
                Migration::new("c"),
            ])
            .unwrap(),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains('a') && message.contains('b'));
        assert!(!message.contains("c,"));
    }

    #[test]
    fn test_ancestors_transitive() {
        let g = graph(vec![
            Migration::new("a"),
            Migration::new("b").depends_on("a"),
            Migration::new("c").depends_on("b"),
        ]);
        let c = g.index_of("c").unwrap();
        let ancestors = g.ancestors(c);
        assert_eq!(ancestors.len(), 2);
        assert!(ancestors.contains(&g.index_of("a").unwrap()));
        assert!(ancestors.contains(&g.index_of("b").unwrap()));
    }

    #[test]
    fn test_descendants_transitive() {
        let g = graph(vec![
            Migration::new("a"),
            Migration::new("b").depends_on("a"),
            Migration::new("c").depends_on("b"),
        ]);
        let a = g.index_of("a").unwrap();
        let descendants = g.descendants(a);
        assert_eq!(descendants.len(), 2);
    }

    #[test]
    fn test_diamond_closures() {
        let g = graph(vec![
            Migration::new("A"),
            Migration::new("B").depends_on("A"),
            Migration::new("C").depends_on("A"),
            Migration::new("D").depends_on("B").depends_on("C"),
        ]);
        let d = g.index_of("D").unwrap();
        assert_eq!(g.ancestors(d).len(), 3);
        let a = g.index_of("A").unwrap();
        assert_eq!(g.descendants(a).len(), 3);
    }
}
