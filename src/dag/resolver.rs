//! Phase resolution: topological layering of work items.
//!
//! A phase is a set of mutually independent items. Phase `k` holds every item
//! whose longest dependency chain has length `k`, so phase `k` can start once
//! all phases before it have resolved.

use crate::dag::builder::{DagBuilder, ItemIndex, WorkItem};
use crate::errors::DependencyError;
use serde::{Deserialize, Serialize};

/// An ordered group of work items with no dependency edges among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    pub index: usize,
    pub items: Vec<WorkItem>,
}

impl ExecutionPhase {
    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Compute execution phases for a set of work items.
///
/// Validation errors (duplicate ids, self-dependencies, missing dependencies)
/// are reported before any cycle check. Within a phase, items keep their input
/// order, so identical input always yields identical phases.
pub fn resolve_phases(items: Vec<WorkItem>) -> Result<Vec<ExecutionPhase>, DependencyError> {
    let graph = DagBuilder::new(items).build()?;
    let total = graph.len();

    let mut in_degree: Vec<usize> = (0..total).map(|i| graph.dependencies(i).len()).collect();
    let mut layers: Vec<Vec<ItemIndex>> = Vec::new();
    let mut current: Vec<ItemIndex> = (0..total).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &dependent in graph.dependents(i) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        // Indices follow input order.
        next.sort_unstable();
        placed += current.len();
        layers.push(std::mem::replace(&mut current, next));
    }

    if placed < total {
        let remaining = (0..total)
            .filter(|&i| in_degree[i] > 0)
            .filter_map(|i| graph.get_item(i).map(|item| item.id.clone()))
            .collect();
        return Err(DependencyError::CircularDependency { cycle: remaining });
    }

    let mut slots: Vec<Option<WorkItem>> = graph.into_items().into_iter().map(Some).collect();
    Ok(layers
        .into_iter()
        .enumerate()
        .map(|(index, members)| ExecutionPhase {
            index,
            items: members
                .into_iter()
                .filter_map(|i| slots[i].take())
                .collect(),
        })
        .collect())
}
