//! Completion guard: exactly-once task completion signals.
//!
//! A [`Completion`] is the one-shot channel a worker uses to report the
//! outcome of its task. Faulty workers may invoke it more than once; only
//! the first invocation is delivered. Every later one raises a
//! [`Violation`] through the run's [`ViolationHook`] — never silently, and
//! never by unwinding back into the worker's call stack (the worker may be
//! inside its own error handling at that point).

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::error;

use crate::source::SourceKey;

// ── Violation reporting ──────────────────────────────────────────────

/// A protocol violation: a task completed more than once.
#[derive(Clone, Debug)]
pub struct Violation {
    /// Key of the offending task.
    pub key: SourceKey,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task `{}` signalled completion more than once", self.key)
    }
}

/// Out-of-band channel for protocol violations.
///
/// Violations bypass the run's result path entirely: the owning run may
/// already have finished normally when the extra completion arrives. The
/// default hook logs at `error` level.
#[derive(Clone)]
pub struct ViolationHook(Arc<dyn Fn(Violation) + Send + Sync>);

impl ViolationHook {
    /// Install a custom handler for violations.
    pub fn new(handler: impl Fn(Violation) + Send + Sync + 'static) -> Self {
        Self(Arc::new(handler))
    }

    pub(crate) fn raise(&self, violation: Violation) {
        (self.0)(violation);
    }
}

impl Default for ViolationHook {
    fn default() -> Self {
        Self::new(|violation| {
            error!(key = %violation.key, "{violation}; extra completion dropped");
        })
    }
}

impl fmt::Debug for ViolationHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ViolationHook(..)")
    }
}

// ── Completion ───────────────────────────────────────────────────────

/// One-shot completion signal for a single task.
///
/// The handle is cheap to clone and may travel into spawned tasks or
/// callbacks; whichever clone resolves first wins the underlying slot.
pub struct Completion<R, E> {
    key: SourceKey,
    slot: Arc<Mutex<Option<oneshot::Sender<Result<R, E>>>>>,
    hook: ViolationHook,
}

impl<R, E> Clone for Completion<R, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            slot: Arc::clone(&self.slot),
            hook: self.hook.clone(),
        }
    }
}

impl<R, E> Completion<R, E> {
    /// Create a guarded completion and the receiver its first outcome is
    /// delivered on. Dropping every handle without resolving closes the
    /// receiver, which the kernel reports as an abandoned completion.
    pub fn channel(
        key: SourceKey,
        hook: ViolationHook,
    ) -> (Self, oneshot::Receiver<Result<R, E>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            key,
            slot: Arc::new(Mutex::new(Some(tx))),
            hook,
        };
        (completion, rx)
    }

    /// Key of the task this completion belongs to.
    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// Report success.
    pub fn resolve(&self, value: R) {
        self.deliver(Ok(value));
    }

    /// Report failure.
    pub fn fail(&self, err: E) {
        self.deliver(Err(err));
    }

    fn deliver(&self, outcome: Result<R, E>) {
        let sender = {
            let mut slot = self
                .slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        match sender {
            // The run may already be gone; an unobserved first completion
            // is not a violation.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => self.hook.raise(Violation {
                key: self.key.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (completion, rx) = Completion::<i32, String>::channel(
            SourceKey::Index(0),
            ViolationHook::new(|_| {}),
        );
        completion.resolve(7);
        completion.resolve(8);
        assert_eq!(rx.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_double_completion_raises_on_hook_only() {
        let violations = Arc::new(AtomicUsize::new(0));
        let seen = violations.clone();
        let hook = ViolationHook::new(move |v| {
            assert_eq!(v.key, SourceKey::Index(3));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let (completion, rx) = Completion::<i32, String>::channel(SourceKey::Index(3), hook);
        completion.resolve(1);
        completion.fail("late".to_string());
        completion.resolve(2);

        assert_eq!(rx.await.unwrap(), Ok(1));
        assert_eq!(violations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clone_shares_the_slot() {
        let (completion, rx) = Completion::<&str, &str>::channel(
            SourceKey::name("job"),
            ViolationHook::new(|_| {}),
        );
        let other = completion.clone();
        other.fail("boom");
        completion.resolve("too late");
        assert_eq!(rx.await.unwrap(), Err("boom"));
    }

    #[tokio::test]
    async fn test_dropping_unresolved_closes_receiver() {
        let (completion, rx) =
            Completion::<(), ()>::channel(SourceKey::Index(0), ViolationHook::default());
        drop(completion);
        assert!(rx.await.is_err());
    }
}
