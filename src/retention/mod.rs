//! Retention analysis for subscription removal.
//!
//! Removing a subscription must not delete objects another live
//! subscription still needs. The resolver evaluates every live query against
//! one consistent snapshot of the local object graph (direct matches plus
//! everything reachable through links) and reports the objects only the
//! removed subscription retained.

mod graph;
mod resolver;

pub use graph::{GraphSnapshot, MemoryGraph, MemorySnapshot, ObjectGraph};
pub use resolver::{orphaned_objects, plan_removal, retained_by, RetentionMarker};
