//! Per-run execution configuration.
//!
//! No process-global knobs: every run carries its own [`Concurrency`] and
//! [`Dispatch`] values.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

// ── Concurrency ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Limit {
    cap: AtomicUsize,
    retuned: Notify,
}

/// Concurrency limit for a run: the cap on in-flight tasks.
///
/// The limit is a shared atomic so long-lived consumers (worker pools) can
/// retune a running kernel; a raise dispatches queued work immediately,
/// a lower limit applies as in-flight tasks complete — tasks are never
/// preempted. Unbounded is modeled as `usize::MAX`. A limit of zero
/// completes a run immediately with zero tasks.
#[derive(Clone, Debug)]
pub struct Concurrency(Arc<Limit>);

impl Concurrency {
    /// Sentinel for "no limit".
    pub const UNBOUNDED: usize = usize::MAX;

    /// Cap in-flight tasks at `limit`.
    pub fn fixed(limit: usize) -> Self {
        Self(Arc::new(Limit {
            cap: AtomicUsize::new(limit),
            retuned: Notify::new(),
        }))
    }

    /// No cap: dispatch every pair the cursor yields.
    pub fn unbounded() -> Self {
        Self::fixed(Self::UNBOUNDED)
    }

    /// Strictly sequential: the next pull happens only after the previous
    /// completion.
    pub fn serial() -> Self {
        Self::fixed(1)
    }

    /// Current limit.
    pub fn get(&self) -> usize {
        self.0.cap.load(Ordering::Relaxed)
    }

    /// Retune the limit. A kernel parked at the old capacity is woken so a
    /// raise dispatches queued work without waiting for a completion.
    pub fn set(&self, limit: usize) {
        self.0.cap.store(limit, Ordering::Relaxed);
        self.0.retuned.notify_one();
    }

    /// Wait for the next [`set`](Concurrency::set) call.
    pub(crate) async fn changed(&self) {
        self.0.retuned.notified().await;
    }

    pub fn is_unbounded(&self) -> bool {
        self.get() == Self::UNBOUNDED
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl From<usize> for Concurrency {
    fn from(limit: usize) -> Self {
        Self::fixed(limit)
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────

/// Dispatch timing policy, traded between throughput and scheduler
/// fairness on long synchronous chains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// Yield to the scheduler after every completion (always-deferred).
    #[default]
    Safe,
    /// Keep dispatching synchronously, yielding only once per
    /// [`FAST_LANE_BUDGET`](crate::kernel::FAST_LANE_BUDGET) completions.
    Fast,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retune_visible_through_clones() {
        let limit = Concurrency::fixed(2);
        let shared = limit.clone();
        shared.set(5);
        assert_eq!(limit.get(), 5);
        assert!(!limit.is_unbounded());
    }

    #[test]
    fn test_defaults() {
        assert!(Concurrency::default().is_unbounded());
        assert_eq!(Dispatch::default(), Dispatch::Safe);
        assert_eq!(Concurrency::serial().get(), 1);
    }
}
