//! Concurrency-controlled task execution kernel.
//!
//! This crate holds the shared primitives the rest of the toolkit is built
//! on: the [`Source`] adapter that normalizes heterogeneous inputs into a
//! uniform `(key, value)` stream, the [`Completion`] guard enforcing
//! exactly-once task completion, and the [`Run`] kernel that drives a worker
//! over a [`Cursor`] under a concurrency limit with first-error-wins and
//! early-stop semantics.
//!
//! Long-lived consumers (worker pools, dependency schedulers) feed the same
//! kernel through their own push-fed [`Cursor`] implementations.

pub mod completion;
pub mod config;
pub mod error;
pub mod kernel;
pub mod source;

pub use completion::{Completion, Violation, ViolationHook};
pub use config::{Concurrency, Dispatch};
pub use error::RunError;
pub use kernel::{Run, RunReport, RunStatus};
pub use source::{Cursor, Pull, Source, SourceCursor, SourceKey};
