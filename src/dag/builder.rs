//! Dependency graph construction and validation for work items.
//!
//! Items are assigned dense integer indices in input order and edges are stored
//! as adjacency lists over those indices. Validation runs in a fixed order:
//! duplicate ids, self-dependencies, missing dependencies, then cycles. The
//! first three are checked before cycle detection because an incomplete graph
//! makes the cycle report misleading.

use crate::errors::DependencyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index into the work item list.
pub type ItemIndex = usize;

/// A unit of schedulable work: one story plus the ids it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            dependencies,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A validated, acyclic graph of work items.
#[derive(Debug)]
pub struct ItemGraph {
    items: Vec<WorkItem>,
    index_map: HashMap<String, ItemIndex>,
    /// index -> items that depend on it
    forward_edges: Vec<Vec<ItemIndex>>,
    /// index -> items it depends on
    reverse_edges: Vec<Vec<ItemIndex>>,
}

impl ItemGraph {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn get_item(&self, index: ItemIndex) -> Option<&WorkItem> {
        self.items.get(index)
    }

    pub fn get_index(&self, id: &str) -> Option<ItemIndex> {
        self.index_map.get(id).copied()
    }

    /// Items that depend on the given item.
    pub fn dependents(&self, index: ItemIndex) -> &[ItemIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Items the given item depends on.
    pub fn dependencies(&self, index: ItemIndex) -> &[ItemIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Consume the graph, returning the items in index order.
    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }
}

/// Builder for constructing validated item graphs.
pub struct DagBuilder {
    items: Vec<WorkItem>,
}

impl DagBuilder {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    /// Validate the items and build the graph.
    pub fn build(self) -> Result<ItemGraph, DependencyError> {
        let mut index_map = HashMap::with_capacity(self.items.len());
        for (i, item) in self.items.iter().enumerate() {
            if index_map.insert(item.id.clone(), i).is_some() {
                return Err(DependencyError::DuplicateItem {
                    item: item.id.clone(),
                });
            }
        }

        for item in &self.items {
            if item.dependencies.iter().any(|dep| dep == &item.id) {
                return Err(DependencyError::SelfDependency {
                    item: item.id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<ItemIndex>> = vec![Vec::new(); self.items.len()];
        let mut reverse_edges: Vec<Vec<ItemIndex>> = vec![Vec::new(); self.items.len()];

        for (to_idx, item) in self.items.iter().enumerate() {
            for dep in &item.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| DependencyError::MissingDependency {
                            item: item.id.clone(),
                            dependency: dep.clone(),
                        })?;
                if !reverse_edges[to_idx].contains(&from_idx) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        let graph = ItemGraph {
            items: self.items,
            index_map,
            forward_edges,
            reverse_edges,
        };

        if let Some(cycle) = find_cycle(&graph) {
            return Err(DependencyError::CircularDependency { cycle });
        }

        Ok(graph)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Iterative three-color DFS over the dependency edges. Returns the ids along
/// the first cycle found, closed with its starting id.
fn find_cycle(graph: &ItemGraph) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.len()];

    for root in 0..graph.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // (node, next dependency position to explore)
        let mut stack: Vec<(ItemIndex, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let deps = graph.dependencies(node);
            if frame.1 < deps.len() {
                let dep = deps[frame.1];
                frame.1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let start = stack
                            .iter()
                            .position(|&(n, _)| n == dep)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&(n, _)| graph.items[n].id.clone())
                            .collect();
                        cycle.push(graph.items[dep].id.clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, deps: Vec<&str>) -> WorkItem {
        WorkItem::new(id, deps.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_build_simple_graph() {
        let items = vec![
            item("a", vec![]),
            item("b", vec!["a"]),
            item("c", vec!["a"]),
            item("d", vec!["b", "c"]),
        ];

        let graph = DagBuilder::new(items).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_duplicate_dependency_edges_collapse() {
        let items = vec![item("a", vec![]), item("b", vec!["a", "a"])];
        let graph = DagBuilder::new(items).build().unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
    }

    #[test]
    fn test_self_dependency_rejected_as_circular() {
        let items = vec![item("a", vec!["a"])];
        let err = DagBuilder::new(items).build().unwrap_err();
        assert!(matches!(err, DependencyError::SelfDependency { .. }));
        assert!(err.is_circular());
    }

    #[test]
    fn test_missing_dependency() {
        let items = vec![item("a", vec!["nonexistent"])];
        let err = DagBuilder::new(items).build().unwrap_err();
        assert_eq!(
            err,
            DependencyError::MissingDependency {
                item: "a".into(),
                dependency: "nonexistent".into()
            }
        );
    }

    #[test]
    fn test_missing_dependency_reported_before_cycle() {
        // a <-> b is a cycle, but c references a missing id.
        let items = vec![
            item("a", vec!["b"]),
            item("b", vec!["a"]),
            item("c", vec!["ghost"]),
        ];
        let err = DagBuilder::new(items).build().unwrap_err();
        assert!(matches!(err, DependencyError::MissingDependency { .. }));
    }

    #[test]
    fn test_cycle_detection() {
        let items = vec![
            item("01", vec!["03"]),
            item("02", vec!["01"]),
            item("03", vec!["02"]),
        ];

        let err = DagBuilder::new(items).build().unwrap_err();
        match err {
            DependencyError::CircularDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_item_id() {
        let items = vec![item("a", vec![]), item("a", vec![])];
        let err = DagBuilder::new(items).build().unwrap_err();
        assert!(matches!(err, DependencyError::DuplicateItem { .. }));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let mut items = vec![item("n0", vec![])];
        for i in 1..20_000 {
            items.push(WorkItem::new(format!("n{i}"), vec![format!("n{}", i - 1)]));
        }
        let graph = DagBuilder::new(items).build().unwrap();
        assert_eq!(graph.len(), 20_000);
    }
}
