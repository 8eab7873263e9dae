//! Dependency resolution for story execution.
//!
//! Stories declare the ids they depend on. The resolver turns that graph into
//! ordered execution phases: every item in a phase is independent of the
//! others, and phase `k + 1` only starts after phase `k` fully resolves.
//!
//! ## Example
//!
//! ```
//! use sdlc::dag::{resolve_phases, WorkItem};
//!
//! let items = vec![
//!     WorkItem::new("S-1", vec![]),
//!     WorkItem::new("S-2", vec!["S-1".to_string()]),
//!     WorkItem::new("S-3", vec!["S-1".to_string()]),
//!     WorkItem::new("S-4", vec!["S-2".to_string(), "S-3".to_string()]),
//! ];
//!
//! let phases = resolve_phases(items).unwrap();
//! assert_eq!(phases.len(), 3);
//! assert_eq!(phases[1].ids(), vec!["S-2", "S-3"]);
//! ```

mod builder;
mod resolver;

pub use builder::{DagBuilder, ItemGraph, ItemIndex, WorkItem};
pub use resolver::{ExecutionPhase, resolve_phases};
