//! Pool lifecycle notifications.

/// A lifecycle transition of a pool, each delivered once per transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// In-flight count reached the concurrency limit.
    Saturated,
    /// In-flight count dropped back to `concurrency - buffer` with no
    /// queued work left to refill it.
    Unsaturated,
    /// The queue length reached zero (work may still be in flight).
    Empty,
    /// Queue empty and nothing in flight. Re-fires if later work drains
    /// again.
    Drain,
}
