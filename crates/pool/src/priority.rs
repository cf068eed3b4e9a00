//! Priority-queue pool variant.

use std::future::Future;

use tokio::sync::mpsc;

use flowkit_core::{Completion, Dispatch, ViolationHook};

use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::queue::{deliver_single, single_item_worker, DoneReceiver, PoolCore, QueueKind};

/// Worker pool dequeuing by priority: lowest number first, FIFO among
/// equals. Same contract as [`Pool`](crate::Pool) otherwise.
pub struct PriorityPool<V, R, E> {
    core: PoolCore<V, R, E>,
}

/// Builder for [`PriorityPool`].
pub struct PriorityPoolBuilder<V, R, E> {
    worker: crate::queue::PoolWorker<V, R, E>,
    concurrency: usize,
    dispatch: Dispatch,
    hook: ViolationHook,
}

impl<V, R, E> PriorityPool<V, R, E>
where
    V: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub fn builder<W, Fut>(worker: W) -> PriorityPoolBuilder<V, R, E>
    where
        W: FnMut(V, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        PriorityPoolBuilder {
            worker: single_item_worker(worker),
            concurrency: 1,
            dispatch: Dispatch::default(),
            hook: ViolationHook::default(),
        }
    }

    /// Enqueue with a priority; lower numbers dispatch first.
    pub fn push(&self, value: V, priority: u64) -> Result<DoneReceiver<R, E>, PoolError> {
        self.core.enqueue(value, priority, false)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running(&self) -> usize {
        self.core.running()
    }

    pub fn idle(&self) -> bool {
        self.core.idle()
    }

    pub fn concurrency(&self) -> usize {
        self.core.concurrency()
    }

    pub fn set_concurrency(&self, limit: usize) {
        self.core.set_concurrency(limit);
    }

    pub fn set_unsaturated_buffer(&self, buffer: usize) {
        self.core.set_unsaturated_buffer(buffer);
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    pub fn pause(&self) {
        self.core.pause();
    }

    pub fn resume(&self) {
        self.core.resume();
    }

    pub fn kill(&self) {
        self.core.kill();
    }

    pub fn workers_list(&self) -> Vec<V> {
        self.core.workers_list()
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.core.events()
    }
}

impl<V, R, E> PriorityPoolBuilder<V, R, E>
where
    V: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn violation_hook(mut self, hook: ViolationHook) -> Self {
        self.hook = hook;
        self
    }

    pub fn build(self) -> PriorityPool<V, R, E> {
        PriorityPool {
            core: PoolCore::spawn(
                QueueKind::Priority,
                self.worker,
                deliver_single(),
                1,
                self.concurrency,
                self.dispatch,
                self.hook,
            ),
        }
    }
}
