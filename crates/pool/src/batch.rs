//! Batch ("cargo") pool variant.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use flowkit_core::{Completion, Dispatch, ViolationHook};

use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::queue::{DeliverFn, DoneReceiver, PoolCore, PoolWorker, QueueKind};

/// Pool dispatching up to `payload` queued items to each worker slot as one
/// batch. Every item in a dispatched batch receives the same outcome on its
/// done-channel, hence `R: Clone, E: Clone`.
pub struct BatchPool<V, R, E> {
    core: PoolCore<V, R, E>,
}

/// Builder for [`BatchPool`].
pub struct BatchPoolBuilder<V, R, E> {
    worker: PoolWorker<V, R, E>,
    payload: usize,
    concurrency: usize,
    dispatch: Dispatch,
    hook: ViolationHook,
}

impl<V, R, E> BatchPool<V, R, E>
where
    V: Clone + Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Start building a batch pool; the worker receives whole batches.
    /// Payload defaults to unbounded (one batch takes everything queued),
    /// concurrency to 1.
    pub fn builder<W, Fut>(worker: W) -> BatchPoolBuilder<V, R, E>
    where
        W: FnMut(Vec<V>, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut worker = worker;
        let boxed: PoolWorker<V, R, E> = Box::new(move |values, completion| {
            let fut: BoxFuture<'static, ()> = Box::pin(worker(values, completion));
            fut
        });
        BatchPoolBuilder {
            worker: boxed,
            payload: usize::MAX,
            concurrency: 1,
            dispatch: Dispatch::default(),
            hook: ViolationHook::default(),
        }
    }

    pub fn push(&self, value: V) -> Result<DoneReceiver<R, E>, PoolError> {
        self.core.enqueue(value, 0, false)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches currently being processed.
    pub fn running(&self) -> usize {
        self.core.running()
    }

    pub fn idle(&self) -> bool {
        self.core.idle()
    }

    pub fn set_concurrency(&self, limit: usize) {
        self.core.set_concurrency(limit);
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

    /// Snapshot of the items in in-flight batches.
    pub fn workers_list(&self) -> Vec<V> {
        self.core.workers_list()
    }

    pub fn events(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.core.events()
    }
}

impl<V, R, E> BatchPoolBuilder<V, R, E>
where
    V: Clone + Send + 'static,
    R: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Maximum items per dispatched batch.
    pub fn payload(mut self, size: usize) -> Self {
        self.payload = size;
        self
    }

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

    pub fn build(self) -> BatchPool<V, R, E> {
        BatchPool {
            core: PoolCore::spawn(
                QueueKind::Fifo,
                self.worker,
                deliver_shared(),
                self.payload,
                self.concurrency,
                self.dispatch,
                self.hook,
            ),
        }
    }
}

/// Every registrant on a batch gets the same outcome.
fn deliver_shared<R, E>() -> DeliverFn<R, E>
where
    R: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    Arc::new(|mut callbacks, outcome| {
        let last = callbacks.pop();
        for tx in callbacks {
            let _ = tx.send(outcome.clone());
        }
        if let Some(tx) = last {
            let _ = tx.send(outcome);
        }
    })
}
