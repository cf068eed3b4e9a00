//! Iteration kernel: drives a worker over a cursor under a concurrency limit.
//!
//! One [`Run`] is one invocation over one cursor. The kernel owns the whole
//! run state (in-flight set, first-error latch, stop flag) and mutates it
//! from a single task, so no locking is involved: dispatch and completion
//! handling interleave in one loop. In-flight work lives in a
//! [`FuturesUnordered`]; when capacity remains and the cursor has nothing
//! ready, the kernel races the cursor's `wait()` against the next completion
//! so late-arriving pairs (pool pushes, newly-ready graph nodes) dispatch
//! promptly.

use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::yield_now;
use tracing::{debug, trace};

use crate::completion::{Completion, ViolationHook};
use crate::config::{Concurrency, Dispatch};
use crate::error::RunError;
use crate::source::{Cursor, Pull, Source, SourceKey};

/// How many consecutive completions [`Dispatch::Fast`] processes before
/// yielding to the scheduler anyway. Bounds synchronous chains so a long
/// run of immediately-ready tasks cannot starve the rest of the runtime.
pub const FAST_LANE_BUDGET: usize = 64;

type BoxWorker<V, R, E> =
    Box<dyn FnMut(SourceKey, V, Completion<R, E>) -> BoxFuture<'static, ()> + Send>;

// ── Run report ───────────────────────────────────────────────────────

/// Terminal state of a run. A run is idle until executed and running
/// during execution; exactly one of these is reached afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// The cursor was exhausted and every task completed successfully.
    Completed,
    /// The first-error latch fired; remaining dispatch was halted.
    Failed,
    /// The early-stop predicate fired before exhaustion.
    Cancelled,
}

/// Final accounting for a run, returned exactly once by [`Run::execute`].
#[derive(Debug)]
pub struct RunReport<E> {
    pub status: RunStatus,
    /// Tasks dispatched to the worker.
    pub started: usize,
    /// Completions observed, including those discarded after a stop or
    /// failure was latched.
    pub completed: usize,
    /// The latched first error, when `status` is [`RunStatus::Failed`].
    pub error: Option<RunError<E>>,
}

impl<E> RunReport<E> {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

// ── Run builder ──────────────────────────────────────────────────────

/// A single kernel invocation, built then executed.
///
/// ```no_run
/// # use std::sync::{Arc, Mutex};
/// # use flowkit_core::{Run, Source, Completion, Concurrency};
/// # async fn demo() {
/// let doubled = Arc::new(Mutex::new(Vec::new()));
/// let sink = doubled.clone();
/// let report = Run::over(
///     Source::sequence(vec![1, 2, 3]),
///     |_key, n: i32, done: Completion<i32, String>| async move {
///         done.resolve(n * 2);
///     },
/// )
/// .limit(Concurrency::fixed(2))
/// .on_result(move |_key, n| sink.lock().unwrap().push(n))
/// .execute()
/// .await;
/// # }
/// ```
pub struct Run<V, R, E> {
    cursor: Box<dyn Cursor<V>>,
    worker: BoxWorker<V, R, E>,
    limit: Concurrency,
    dispatch: Dispatch,
    on_result: Option<Box<dyn FnMut(SourceKey, R) + Send>>,
    stop_when: Option<Box<dyn FnMut(&R) -> bool + Send>>,
    hook: ViolationHook,
}

impl<V, R, E> Run<V, R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    /// Run a worker over an adapted [`Source`].
    pub fn over<W, Fut>(source: Source<V>, worker: W) -> Self
    where
        V: Clone + Send + 'static,
        W: FnMut(SourceKey, V, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_cursor(source.into_cursor(), worker)
    }

    /// Run a worker over any cursor, including push-fed ones.
    pub fn with_cursor<C, W, Fut>(cursor: C, mut worker: W) -> Self
    where
        C: Cursor<V> + 'static,
        W: FnMut(SourceKey, V, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            cursor: Box::new(cursor),
            worker: Box::new(move |key, value, completion| {
                let fut: BoxFuture<'static, ()> = Box::pin(worker(key, value, completion));
                fut
            }),
            limit: Concurrency::unbounded(),
            dispatch: Dispatch::default(),
            on_result: None,
            stop_when: None,
            hook: ViolationHook::default(),
        }
    }

    /// Cap in-flight tasks (default: unbounded).
    pub fn limit(mut self, limit: impl Into<Concurrency>) -> Self {
        self.limit = limit.into();
        self
    }

    /// Dispatch timing policy (default: [`Dispatch::Safe`]).
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Record each successful result. The kernel owns no accumulator; the
    /// caller injects one.
    pub fn on_result(mut self, record: impl FnMut(SourceKey, R) + Send + 'static) -> Self {
        self.on_result = Some(Box::new(record));
        self
    }

    /// Early-termination predicate, evaluated against each successful
    /// result. Once it fires, no new pairs are pulled; in-flight tasks
    /// still run to completion but their results are discarded.
    pub fn stop_when(mut self, predicate: impl FnMut(&R) -> bool + Send + 'static) -> Self {
        self.stop_when = Some(Box::new(predicate));
        self
    }

    /// Where double-completion violations are reported (default: the
    /// `tracing` error channel).
    pub fn violation_hook(mut self, hook: ViolationHook) -> Self {
        self.hook = hook;
        self
    }

    /// Drive the run to exhaustion, early stop, or failure.
    pub async fn execute(mut self) -> RunReport<E> {
        if self.limit.get() == 0 {
            debug!("concurrency limit is zero, completing with no tasks");
            return RunReport {
                status: RunStatus::Completed,
                started: 0,
                completed: 0,
                error: None,
            };
        }

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (SourceKey, Result<R, RunError<E>>)>> =
            FuturesUnordered::new();
        let mut started = 0usize;
        let mut completed = 0usize;
        let mut error: Option<RunError<E>> = None;
        let mut stopped = false;
        let mut exhausted = false;
        let mut fast_streak = 0usize;

        loop {
            // Dispatch phase: fill capacity while nothing is latched.
            if error.is_none() && !stopped && !exhausted {
                while in_flight.len() < self.limit.get() {
                    match self.cursor.take_next() {
                        Pull::Item(key, value) => {
                            started += 1;
                            trace!(key = %key, in_flight = in_flight.len() + 1, "dispatching task");
                            let (completion, rx) =
                                Completion::channel(key.clone(), self.hook.clone());
                            let task = (self.worker)(key.clone(), value, completion);
                            in_flight.push(Box::pin(async move {
                                task.await;
                                let outcome = match rx.await {
                                    Ok(Ok(value)) => Ok(value),
                                    Ok(Err(e)) => Err(RunError::Worker {
                                        key: key.clone(),
                                        error: e,
                                    }),
                                    Err(_) => Err(RunError::Abandoned { key: key.clone() }),
                                };
                                (key, outcome)
                            }));
                        }
                        Pull::Pending => break,
                        Pull::Exhausted => {
                            exhausted = true;
                            break;
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if exhausted || stopped || error.is_some() {
                    break;
                }
                // Push-fed cursor with nothing queued: park until it
                // either produces or declares the stream over.
                if !self.cursor.wait().await {
                    exhausted = true;
                    break;
                }
                continue;
            }

            // Completion phase. With spare capacity, also watch for late
            // arrivals so new pairs don't wait behind a slow task.
            let can_accept =
                error.is_none() && !stopped && !exhausted && in_flight.len() < self.limit.get();
            let next = if can_accept {
                tokio::select! {
                    done = in_flight.next() => done,
                    more = self.cursor.wait() => {
                        if !more {
                            exhausted = true;
                        }
                        continue;
                    }
                }
            } else if error.is_none() && !stopped && !exhausted {
                // At capacity with work possibly still queued: a retuned
                // limit re-enters the dispatch phase right away.
                tokio::select! {
                    done = in_flight.next() => done,
                    _ = self.limit.changed() => continue,
                }
            } else {
                in_flight.next().await
            };
            let Some((key, outcome)) = next else { continue };
            completed += 1;

            match outcome {
                Ok(value) => {
                    if error.is_none() && !stopped {
                        if let Some(stop) = self.stop_when.as_mut() {
                            if stop(&value) {
                                stopped = true;
                                debug!(key = %key, "early-stop predicate matched");
                            }
                        }
                        if let Some(record) = self.on_result.as_mut() {
                            record(key, value);
                        }
                    } else {
                        trace!(key = %key, "result discarded after stop/failure latch");
                    }
                }
                Err(failure) => {
                    if error.is_none() {
                        debug!(key = %key, "first error latched, halting new dispatch");
                        error = Some(failure);
                    } else {
                        trace!(key = %key, "subsequent error swallowed");
                    }
                }
            }

            match self.dispatch {
                Dispatch::Safe => yield_now().await,
                Dispatch::Fast => {
                    fast_streak += 1;
                    if fast_streak >= FAST_LANE_BUDGET {
                        fast_streak = 0;
                        yield_now().await;
                    }
                }
            }
        }

        let status = if error.is_some() {
            RunStatus::Failed
        } else if stopped {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        debug!(?status, started, completed, "run finished");
        RunReport {
            status,
            started,
            completed,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::sleep;

    fn collected<T>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        (out.clone(), out)
    }

    #[tokio::test]
    async fn test_unbounded_run_collects_all_results() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::sequence(vec![1, 2, 3, 4]),
            |_key, n: i32, done: Completion<i32, String>| async move {
                done.resolve(n * 10);
            },
        )
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.started, 4);
        assert_eq!(report.completed, 4);
        let mut results = out.lock().unwrap().clone();
        results.sort_unstable();
        assert_eq!(results, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_serial_limit_dispatches_in_cursor_order() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::sequence(vec!["a", "b", "c"]),
            |_key, v: &'static str, done: Completion<&'static str, String>| async move {
                // Earlier items take longer; serial order must still hold.
                let delay = match v {
                    "a" => 30,
                    "b" => 15,
                    _ => 1,
                };
                sleep(Duration::from_millis(delay)).await;
                done.resolve(v);
            },
        )
        .limit(Concurrency::serial())
        .on_result(move |_key, v| sink.lock().unwrap().push(v))
        .execute()
        .await;

        assert!(report.is_completed());
        assert_eq!(*out.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_finite_limit_bounds_in_flight() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current2, peak2) = (current.clone(), peak.clone());

        let report = Run::over(
            Source::sequence((0..20).collect::<Vec<_>>()),
            move |_key, _n: i32, done: Completion<(), String>| {
                let current = current2.clone();
                let peak = peak2.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    done.resolve(());
                }
            },
        )
        .limit(Concurrency::fixed(3))
        .execute()
        .await;

        assert!(report.is_completed());
        assert_eq!(report.completed, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3, "in-flight exceeded limit");
    }

    #[tokio::test]
    async fn test_raised_limit_takes_effect_before_next_completion() {
        let limit = Concurrency::fixed(1);
        let handle = limit.clone();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current2, peak2) = (current.clone(), peak.clone());

        let run = tokio::spawn(
            Run::over(
                Source::sequence(vec![1, 2, 3]),
                move |_key, _n: i32, done: Completion<(), String>| {
                    let current = current2.clone();
                    let peak = peak2.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(100)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        done.resolve(());
                    }
                },
            )
            .limit(limit)
            .execute(),
        );

        // The first task is still sleeping when the limit goes up; the
        // remaining two must join it rather than wait their turn.
        sleep(Duration::from_millis(20)).await;
        handle.set(3);

        let report = run.await.unwrap();
        assert!(report.is_completed());
        assert_eq!(
            peak.load(Ordering::SeqCst),
            3,
            "raised limit waited for a completion"
        );
    }

    #[tokio::test]
    async fn test_zero_limit_completes_immediately() {
        let report = Run::over(
            Source::sequence(vec![1, 2, 3]),
            |_key, _n: i32, done: Completion<(), String>| async move {
                done.resolve(());
            },
        )
        .limit(0usize)
        .execute()
        .await;

        assert!(report.is_completed());
        assert_eq!(report.started, 0);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_halts_dispatch() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::sequence(vec![1, 2, 3, 4]),
            |_key, n: i32, done: Completion<i32, String>| async move {
                if n == 3 {
                    sleep(Duration::from_millis(1)).await;
                    done.fail(format!("task {n} broke"));
                } else {
                    sleep(Duration::from_millis(40)).await;
                    done.resolve(n);
                }
            },
        )
        .limit(Concurrency::fixed(3))
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        // Task 4 was never dispatched: the latch fired while 1 and 2 slept.
        assert_eq!(report.started, 3);
        assert_eq!(report.completed, 3);
        match report.error {
            Some(RunError::Worker { ref key, ref error }) => {
                assert_eq!(key.index(), Some(2));
                assert_eq!(error, "task 3 broke");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Results of 1 and 2 arrived after the latch and were discarded.
        assert!(out.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_before_latch_are_preserved() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::sequence(vec![1, 2, 3]),
            |_key, n: i32, done: Completion<i32, String>| async move {
                sleep(Duration::from_millis(n as u64 * 10)).await;
                if n == 3 {
                    done.fail("late failure".to_string());
                } else {
                    done.resolve(n);
                }
            },
        )
        .limit(Concurrency::fixed(3))
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(*out.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_early_stop_halts_new_pulls() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::sequence((1..=100).collect::<Vec<_>>()),
            |_key, n: i32, done: Completion<i32, String>| async move {
                done.resolve(n);
            },
        )
        .limit(Concurrency::serial())
        .stop_when(|n| *n == 5)
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.started, 5);
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_abandoned_completion_is_a_run_error() {
        let report = Run::over(
            Source::sequence(vec![1]),
            |_key, _n: i32, done: Completion<i32, String>| async move {
                drop(done);
            },
        )
        .execute()
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(matches!(report.error, Some(RunError::Abandoned { .. })));
    }

    #[tokio::test]
    async fn test_double_completion_never_delivers_twice() {
        let violations = Arc::new(AtomicUsize::new(0));
        let seen = violations.clone();
        let (sink, out) = collected();

        let report = Run::over(
            Source::sequence(vec![7]),
            |_key, n: i32, done: Completion<i32, String>| async move {
                done.resolve(n);
                done.resolve(n + 1);
            },
        )
        .violation_hook(ViolationHook::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert!(report.is_completed());
        assert_eq!(*out.lock().unwrap(), vec![7]);
        assert_eq!(violations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fast_dispatch_matches_safe_results() {
        let (sink, out) = collected();
        let report = Run::over(
            Source::lazy(0..200),
            |_key, n: i32, done: Completion<i32, String>| async move {
                done.resolve(n);
            },
        )
        .dispatch(Dispatch::Fast)
        .limit(Concurrency::fixed(4))
        .on_result(move |_key, n| sink.lock().unwrap().push(n))
        .execute()
        .await;

        assert!(report.is_completed());
        assert_eq!(out.lock().unwrap().len(), 200);
    }
}
