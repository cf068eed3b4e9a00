//! Push-based worker pools over the `flowkit-core` iteration kernel.
//!
//! A pool is a long-lived kernel run whose cursor is fed by an internal
//! queue: items arrive over time via [`Pool::push`], dispatch is capped by a
//! runtime-adjustable concurrency limit, and lifecycle transitions
//! (saturated, unsaturated, empty, drain) are observable as [`PoolEvent`]s.
//!
//! Three dequeue policies share the machinery:
//! - [`Pool`] — FIFO, with `unshift` for front-of-queue inserts;
//! - [`PriorityPool`] — lowest priority number first, FIFO tie-break;
//! - [`BatchPool`] — "cargo" dispatch of up to `payload` items per worker
//!   slot, one shared result per batch.
//!
//! Worker failures never halt a pool; they are routed to the failed item's
//! done-channel only.

pub mod batch;
pub mod error;
pub mod events;
pub mod priority;
pub mod queue;

pub use batch::{BatchPool, BatchPoolBuilder};
pub use error::PoolError;
pub use events::PoolEvent;
pub use priority::{PriorityPool, PriorityPoolBuilder};
pub use queue::{DoneReceiver, Pool, PoolBuilder};
