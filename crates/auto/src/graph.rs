//! Task graph construction and structural validation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use flowkit_core::Completion;

use crate::error::GraphError;

/// Boxed task body. It receives the results of its declared dependencies
/// and reports through its completion.
pub type NodeFn<R, E> =
    Box<dyn FnMut(IndexMap<String, R>, Completion<R, E>) -> BoxFuture<'static, ()> + Send>;

pub(crate) struct NodeSpec<R, E> {
    pub(crate) deps: Vec<String>,
    pub(crate) run: NodeFn<R, E>,
}

/// A named task graph with explicit dependency lists.
///
/// ```no_run
/// # use flowkit_auto::TaskGraph;
/// # use flowkit_core::{Completion, Concurrency};
/// # async fn demo() {
/// let mut graph: TaskGraph<u32, String> = TaskGraph::new();
/// graph
///     .add("fetch", Vec::<String>::new(), |_deps, done: Completion<u32, String>| async move {
///         done.resolve(40);
///     })
///     .add("report", ["fetch"], |deps, done: Completion<u32, String>| async move {
///         done.resolve(deps["fetch"] + 2);
///     });
/// let outcome = graph.execute(Concurrency::fixed(2)).await.unwrap();
/// assert_eq!(outcome.results["report"], 42);
/// # }
/// ```
pub struct TaskGraph<R, E> {
    pub(crate) nodes: IndexMap<String, NodeSpec<R, E>>,
    duplicates: Vec<String>,
}

impl<R, E> Default for TaskGraph<R, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, E> TaskGraph<R, E> {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// Register a task. Duplicate dependency entries are collapsed;
    /// duplicate task names are rejected at execution time.
    pub fn add<N, D, W, Fut>(&mut self, name: N, deps: D, task: W) -> &mut Self
    where
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
        W: FnMut(IndexMap<String, R>, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut unique: Vec<String> = Vec::new();
        for dep in deps {
            let dep = dep.into();
            if !unique.contains(&dep) {
                unique.push(dep);
            }
        }
        let mut task = task;
        let run: NodeFn<R, E> = Box::new(move |results, completion| {
            let fut: BoxFuture<'static, ()> = Box::pin(task(results, completion));
            fut
        });
        if self
            .nodes
            .insert(name.clone(), NodeSpec { deps: unique, run })
            .is_some()
        {
            self.duplicates.push(name);
        }
        self
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Reject duplicate names, undeclared dependencies, and cycles.
    pub(crate) fn validate(&self) -> Result<(), GraphError> {
        if let Some(name) = self.duplicates.first() {
            return Err(GraphError::DuplicateTask(name.clone()));
        }
        for (name, spec) in &self.nodes {
            for dep in &spec.deps {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; whatever cannot be peeled off sits on a cycle.
        let mut waiting: IndexMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.deps.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, spec) in &self.nodes {
            for dep in &spec.deps {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }
        let mut peelable: VecDeque<&str> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut peeled = 0usize;
        while let Some(name) = peelable.pop_front() {
            peeled += 1;
            if let Some(next) = dependents.get(name) {
                for dependent in next {
                    if let Some(count) = waiting.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            peelable.push_back(dependent);
                        }
                    }
                }
            }
        }
        if peeled < self.nodes.len() {
            let stuck = waiting
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_graph(edges: &[(&str, &[&str])]) -> TaskGraph<u32, String> {
        let mut graph = TaskGraph::new();
        for (name, deps) in edges {
            graph.add(
                *name,
                deps.iter().copied(),
                |_deps, done: Completion<u32, String>| async move {
                    done.resolve(0);
                },
            );
        }
        graph
    }

    #[test]
    fn test_valid_graph_passes() {
        let graph = noop_graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let graph = noop_graph(&[("a", &["ghost"])]);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let graph = noop_graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("free", &[])]);
        match graph.validate() {
            Err(GraphError::Cycle(stuck)) => {
                let mut stuck = stuck;
                stuck.sort();
                assert_eq!(stuck, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = noop_graph(&[("a", &["a"])]);
        assert!(matches!(graph.validate(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut graph: TaskGraph<u32, String> = TaskGraph::new();
        graph.add("a", Vec::<String>::new(), |_d, done| async move {
            done.resolve(1);
        });
        graph.add("a", Vec::<String>::new(), |_d, done| async move {
            done.resolve(2);
        });
        assert_eq!(
            graph.validate(),
            Err(GraphError::DuplicateTask("a".to_string()))
        );
    }
}
