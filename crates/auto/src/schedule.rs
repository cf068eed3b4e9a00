//! Graph execution through the iteration kernel.
//!
//! Ready nodes flow through a push-fed cursor: each successful node
//! decrements its dependents' unresolved-dependency counters, and nodes
//! reaching zero become late-arriving cursor pairs. The kernel's limit caps
//! how many ready nodes run simultaneously; its first-error latch is what
//! halts scheduling of not-yet-started nodes after a failure.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::Notify;
use tracing::debug;

use flowkit_core::{
    Completion, Concurrency, Cursor, Dispatch, Pull, Run, RunError, SourceKey,
};

use crate::error::{AutoFailure, GraphError};
use crate::graph::{NodeFn, TaskGraph};

// ── Outcome ──────────────────────────────────────────────────────────

/// Result of driving a task graph: every finished task's result, plus the
/// failure that stopped scheduling, if any.
#[derive(Debug)]
pub struct AutoOutcome<R, E> {
    /// Results of tasks that completed, in completion order. Partial when
    /// `error` is set.
    pub results: IndexMap<String, R>,
    pub error: Option<AutoFailure<E>>,
}

impl<R, E> AutoOutcome<R, E> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Split into full results or `(failure, partial results)`.
    pub fn into_results(self) -> Result<IndexMap<String, R>, (AutoFailure<E>, IndexMap<String, R>)> {
        match self.error {
            None => Ok(self.results),
            Some(failure) => Err((failure, self.results)),
        }
    }
}

// ── Shared schedule state ────────────────────────────────────────────

struct ScheduleState<R> {
    ready: VecDeque<String>,
    dispatched: usize,
    total: usize,
    waiting: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    deps_of: HashMap<String, Vec<String>>,
    results: IndexMap<String, R>,
}

fn lock<R>(state: &Arc<Mutex<ScheduleState<R>>>) -> MutexGuard<'_, ScheduleState<R>> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct GraphCursor<R> {
    state: Arc<Mutex<ScheduleState<R>>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl<R: Send> Cursor<()> for GraphCursor<R> {
    fn take_next(&mut self) -> Pull<()> {
        let mut st = lock(&self.state);
        match st.ready.pop_front() {
            Some(name) => {
                st.dispatched += 1;
                Pull::Item(SourceKey::name(name), ())
            }
            None if st.dispatched == st.total => Pull::Exhausted,
            None => Pull::Pending,
        }
    }

    fn remaining(&self) -> Option<usize> {
        Some(lock(&self.state).ready.len())
    }

    async fn wait(&mut self) -> bool {
        loop {
            {
                let st = lock(&self.state);
                if !st.ready.is_empty() {
                    return true;
                }
                if st.dispatched == st.total {
                    return false;
                }
            }
            self.notify.notified().await;
        }
    }
}

// ── Execution ────────────────────────────────────────────────────────

impl<R, E> TaskGraph<R, E>
where
    R: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Validate and drive the graph with the default (safe) dispatch
    /// policy.
    pub async fn execute(
        self,
        limit: impl Into<Concurrency>,
    ) -> Result<AutoOutcome<R, E>, GraphError> {
        self.execute_with(limit, Dispatch::default()).await
    }

    /// Validate and drive the graph.
    pub async fn execute_with(
        self,
        limit: impl Into<Concurrency>,
        dispatch: Dispatch,
    ) -> Result<AutoOutcome<R, E>, GraphError> {
        self.validate()?;

        let total = self.nodes.len();
        let mut waiting = HashMap::with_capacity(total);
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut deps_of = HashMap::with_capacity(total);
        let mut ready = VecDeque::new();
        let mut fns: HashMap<String, NodeFn<R, E>> = HashMap::with_capacity(total);

        for (name, spec) in self.nodes {
            if spec.deps.is_empty() {
                ready.push_back(name.clone());
            }
            waiting.insert(name.clone(), spec.deps.len());
            for dep in &spec.deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(name.clone());
            }
            deps_of.insert(name.clone(), spec.deps);
            fns.insert(name, spec.run);
        }

        let state = Arc::new(Mutex::new(ScheduleState::<R> {
            ready,
            dispatched: 0,
            total,
            waiting,
            dependents,
            deps_of,
            results: IndexMap::new(),
        }));
        let notify = Arc::new(Notify::new());

        let cursor = GraphCursor {
            state: state.clone(),
            notify: notify.clone(),
        };

        let worker_state = state.clone();
        let worker = move |key: SourceKey, _unit: (), done: Completion<R, E>| {
            let name = key.as_name().unwrap_or_default().to_string();
            let dep_results = {
                let st = lock(&worker_state);
                let deps = st.deps_of.get(&name).cloned().unwrap_or_default();
                deps.into_iter()
                    .filter_map(|dep| st.results.get(&dep).map(|r| (dep.clone(), r.clone())))
                    .collect::<IndexMap<String, R>>()
            };
            debug!(task = %name, "starting task");
            match fns.get_mut(&name) {
                Some(run) => run(dep_results, done),
                // Unreachable: the cursor only yields registered names.
                None => Box::pin(async {}),
            }
        };

        let record_state = state.clone();
        let record_notify = notify.clone();
        let report = Run::with_cursor(cursor, worker)
            .limit(limit)
            .dispatch(dispatch)
            .on_result(move |key, value| {
                let Some(name) = key.as_name().map(str::to_string) else {
                    return;
                };
                let mut st = lock(&record_state);
                st.results.insert(name.clone(), value);
                if let Some(next) = st.dependents.get(&name).cloned() {
                    for dependent in next {
                        if let Some(count) = st.waiting.get_mut(&dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                debug!(task = %dependent, "dependencies resolved, task ready");
                                st.ready.push_back(dependent);
                            }
                        }
                    }
                }
                drop(st);
                record_notify.notify_one();
            })
            .execute()
            .await;

        let results = std::mem::take(&mut lock(&state).results);
        let error = report.error.map(|e| match e {
            RunError::Worker { key, error } => AutoFailure::Task {
                task: key.to_string(),
                error,
            },
            RunError::Abandoned { key } => AutoFailure::Abandoned {
                task: key.to_string(),
            },
        });
        Ok(AutoOutcome { results, error })
    }
}

/// Drive a task graph under a concurrency cap; shorthand for
/// [`TaskGraph::execute`].
pub async fn auto<R, E>(
    graph: TaskGraph<R, E>,
    limit: impl Into<Concurrency>,
) -> Result<AutoOutcome<R, E>, GraphError>
where
    R: Clone + Send + 'static,
    E: Send + 'static,
{
    graph.execute(limit).await
}
