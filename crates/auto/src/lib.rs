//! Dependency scheduler: resolves a named task graph into a valid execution
//! order and drives it through the `flowkit-core` kernel.
//!
//! Build a [`TaskGraph`], then [`execute`](TaskGraph::execute) it under a
//! concurrency cap. Structural problems (duplicate names, unknown
//! dependencies, cycles) are rejected synchronously before any task runs;
//! the first task failure halts scheduling of not-yet-started nodes and the
//! outcome carries the error together with the partial result map.

pub mod error;
pub mod graph;
pub mod schedule;

pub use error::{AutoFailure, GraphError};
pub use graph::TaskGraph;
pub use schedule::{auto, AutoOutcome};
