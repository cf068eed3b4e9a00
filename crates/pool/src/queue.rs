//! FIFO worker pool and the queue machinery shared by all pool variants.
//!
//! Each pool owns one spawned driver task running a single long-lived
//! kernel [`Run`] whose cursor pops from the pool's queue. The queue state
//! sits behind a mutex; a [`Notify`] wakes the driver when items arrive,
//! the pool resumes, or it is killed.

use std::collections::{BinaryHeap, VecDeque};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flowkit_core::{
    Completion, Concurrency, Cursor, Dispatch, Pull, Run, SourceKey, ViolationHook,
};

use crate::error::PoolError;
use crate::events::PoolEvent;

// ── Queue items ──────────────────────────────────────────────────────

/// Receives the outcome of one pushed item. Errors with `RecvError` when
/// the item was discarded (killed pool) or its worker abandoned the
/// completion.
pub type DoneReceiver<R, E> = oneshot::Receiver<Result<R, E>>;

pub(crate) struct QueueItem<V, R, E> {
    seq: u64,
    priority: u64,
    value: V,
    done: oneshot::Sender<Result<R, E>>,
}

impl<V, R, E> PartialEq for QueueItem<V, R, E> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<V, R, E> Eq for QueueItem<V, R, E> {}

impl<V, R, E> PartialOrd for QueueItem<V, R, E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<V, R, E> Ord for QueueItem<V, R, E> {
    // BinaryHeap is a max-heap; invert so the lowest (priority, seq) pair
    // pops first. The monotonic seq is the FIFO tie-break.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

pub(crate) enum QueueKind {
    Fifo,
    Priority,
}

enum QueueRepr<V, R, E> {
    Fifo(VecDeque<QueueItem<V, R, E>>),
    Priority(BinaryHeap<QueueItem<V, R, E>>),
}

impl<V, R, E> QueueRepr<V, R, E> {
    fn len(&self) -> usize {
        match self {
            QueueRepr::Fifo(q) => q.len(),
            QueueRepr::Priority(h) => h.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&mut self) -> Option<QueueItem<V, R, E>> {
        match self {
            QueueRepr::Fifo(q) => q.pop_front(),
            QueueRepr::Priority(h) => h.pop(),
        }
    }

    fn clear(&mut self) {
        match self {
            QueueRepr::Fifo(q) => q.clear(),
            QueueRepr::Priority(h) => h.clear(),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────

struct PoolState<V, R, E> {
    queue: QueueRepr<V, R, E>,
    next_seq: u64,
    running: usize,
    killed: bool,
    paused: bool,
    saturated: bool,
    workers: Vec<(u64, V)>,
    events: Option<mpsc::UnboundedSender<PoolEvent>>,
}

impl<V, R, E> PoolState<V, R, E> {
    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            debug!(?event, "pool event");
            let _ = tx.send(event);
        }
    }
}

pub(crate) struct PoolShared<V, R, E> {
    state: Mutex<PoolState<V, R, E>>,
    notify: Notify,
    concurrency: Concurrency,
    // 0 means "auto": 25% of concurrency, at least 1.
    unsaturated_buffer: AtomicUsize,
}

impl<V, R, E> PoolShared<V, R, E> {
    fn lock(&self) -> MutexGuard<'_, PoolState<V, R, E>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective_buffer(&self) -> usize {
        let explicit = self.unsaturated_buffer.load(Ordering::Relaxed);
        if explicit > 0 {
            explicit
        } else {
            (self.concurrency.get() / 4).max(1)
        }
    }
}

// ── Cursor over the queue ────────────────────────────────────────────

struct QueueCursor<V, R, E> {
    shared: Arc<PoolShared<V, R, E>>,
    payload: usize,
}

#[async_trait]
impl<V, R, E> Cursor<Vec<QueueItem<V, R, E>>> for QueueCursor<V, R, E>
where
    V: Send,
    R: Send,
    E: Send,
{
    fn take_next(&mut self) -> Pull<Vec<QueueItem<V, R, E>>> {
        let mut st = self.shared.lock();
        if st.killed {
            return Pull::Exhausted;
        }
        if st.paused || st.queue.is_empty() {
            return Pull::Pending;
        }
        let take = self.payload.min(st.queue.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(item) = st.queue.pop() {
                batch.push(item);
            }
        }
        if st.queue.is_empty() {
            st.emit(PoolEvent::Empty);
        }
        let seq = batch.first().map(|item| item.seq).unwrap_or_default();
        Pull::Item(SourceKey::Index(seq as usize), batch)
    }

    fn remaining(&self) -> Option<usize> {
        Some(self.shared.lock().queue.len())
    }

    async fn wait(&mut self) -> bool {
        loop {
            {
                let st = self.shared.lock();
                if st.killed {
                    return false;
                }
                if !st.paused && !st.queue.is_empty() {
                    return true;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────

pub(crate) type PoolWorker<V, R, E> =
    Box<dyn FnMut(Vec<V>, Completion<R, E>) -> BoxFuture<'static, ()> + Send>;

/// Fans one batch outcome out to the batch's done-channels.
pub(crate) type DeliverFn<R, E> =
    Arc<dyn Fn(Vec<oneshot::Sender<Result<R, E>>>, Result<R, E>) + Send + Sync>;

/// Common core behind [`Pool`], [`PriorityPool`](crate::PriorityPool), and
/// [`BatchPool`](crate::BatchPool).
pub(crate) struct PoolCore<V, R, E> {
    shared: Arc<PoolShared<V, R, E>>,
    _driver: JoinHandle<()>,
}

impl<V, R, E> PoolCore<V, R, E>
where
    V: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn spawn(
        kind: QueueKind,
        mut worker: PoolWorker<V, R, E>,
        deliver: DeliverFn<R, E>,
        payload: usize,
        concurrency: usize,
        dispatch: Dispatch,
        hook: ViolationHook,
    ) -> Self {
        let queue = match kind {
            QueueKind::Fifo => QueueRepr::Fifo(VecDeque::new()),
            QueueKind::Priority => QueueRepr::Priority(BinaryHeap::new()),
        };
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue,
                next_seq: 0,
                running: 0,
                killed: false,
                paused: false,
                saturated: false,
                workers: Vec::new(),
                events: None,
            }),
            notify: Notify::new(),
            concurrency: Concurrency::fixed(concurrency.max(1)),
            unsaturated_buffer: AtomicUsize::new(0),
        });

        let cursor = QueueCursor {
            shared: shared.clone(),
            payload: payload.max(1),
        };
        let limit = shared.concurrency.clone();
        let wrapper_shared = shared.clone();
        let wrapper_hook = hook.clone();

        let kernel_worker = move |key: SourceKey,
                                  batch: Vec<QueueItem<V, R, E>>,
                                  slot: Completion<(), Infallible>| {
            let shared = wrapper_shared.clone();
            let mut seqs = Vec::with_capacity(batch.len());
            let mut values = Vec::with_capacity(batch.len());
            let mut callbacks = Vec::with_capacity(batch.len());
            for item in batch {
                seqs.push(item.seq);
                callbacks.push(item.done);
                values.push(item.value);
            }

            {
                let mut st = shared.lock();
                st.running += 1;
                for (seq, value) in seqs.iter().zip(values.iter()) {
                    st.workers.push((*seq, value.clone()));
                }
                let cap = shared.concurrency.get();
                if !st.saturated && st.running >= cap {
                    st.saturated = true;
                    st.emit(PoolEvent::Saturated);
                }
            }

            let (inner, rx) = Completion::channel(key, wrapper_hook.clone());
            let task = worker(values, inner);
            let deliver = deliver.clone();

            let fut: BoxFuture<'static, ()> = Box::pin(async move {
                task.await;
                let outcome = rx.await;
                let killed = shared.lock().killed;
                match outcome {
                    // A killed pool drops results on the floor.
                    Ok(outcome) if !killed => deliver(callbacks, outcome),
                    Ok(_) => drop(callbacks),
                    Err(_) => {
                        warn!(
                            abandoned = callbacks.len(),
                            "pool worker dropped its completion; waiters abandoned"
                        );
                        drop(callbacks);
                    }
                }

                let mut st = shared.lock();
                st.running -= 1;
                st.workers.retain(|(seq, _)| !seqs.contains(seq));
                let cap = shared.concurrency.get();
                let buffer = shared.effective_buffer();
                // Unsaturated only once the dip is real: queued work would
                // refill the slot immediately.
                if st.saturated
                    && st.queue.is_empty()
                    && st.running <= cap.saturating_sub(buffer)
                {
                    st.saturated = false;
                    st.emit(PoolEvent::Unsaturated);
                }
                if !st.killed && st.running == 0 && st.queue.is_empty() {
                    st.emit(PoolEvent::Drain);
                }
                drop(st);
                slot.resolve(());
            });
            fut
        };

        let driver = tokio::spawn(async move {
            let report = Run::with_cursor(cursor, kernel_worker)
                .limit(limit)
                .dispatch(dispatch)
                .violation_hook(hook)
                .execute()
                .await;
            debug!(
                started = report.started,
                completed = report.completed,
                "pool driver finished"
            );
        });

        Self {
            shared,
            _driver: driver,
        }
    }

    pub(crate) fn enqueue(
        &self,
        value: V,
        priority: u64,
        front: bool,
    ) -> Result<DoneReceiver<R, E>, PoolError> {
        let mut st = self.shared.lock();
        if st.killed {
            return Err(PoolError::Killed);
        }
        let (tx, rx) = oneshot::channel();
        let seq = st.next_seq;
        st.next_seq += 1;
        let item = QueueItem {
            seq,
            priority,
            value,
            done: tx,
        };
        match &mut st.queue {
            QueueRepr::Fifo(q) if front => q.push_front(item),
            QueueRepr::Fifo(q) => q.push_back(item),
            QueueRepr::Priority(h) => h.push(item),
        }
        drop(st);
        self.shared.notify.notify_one();
        Ok(rx)
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub(crate) fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub(crate) fn idle(&self) -> bool {
        let st = self.shared.lock();
        st.queue.is_empty() && st.running == 0
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.shared.concurrency.get()
    }

    pub(crate) fn set_concurrency(&self, limit: usize) {
        self.shared.concurrency.set(limit.max(1));
        self.shared.notify.notify_one();
    }

    pub(crate) fn set_unsaturated_buffer(&self, buffer: usize) {
        self.shared
            .unsaturated_buffer
            .store(buffer, Ordering::Relaxed);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub(crate) fn pause(&self) {
        self.shared.lock().paused = true;
    }

    pub(crate) fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.notify.notify_one();
    }

    pub(crate) fn kill(&self) {
        {
            let mut st = self.shared.lock();
            st.killed = true;
            st.queue.clear();
            st.events = None;
        }
        self.shared.notify.notify_one();
    }

    pub(crate) fn workers_list(&self) -> Vec<V> {
        self.shared
            .lock()
            .workers
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().events = Some(tx);
        rx
    }
}

impl<V, R, E> Drop for PoolCore<V, R, E> {
    fn drop(&mut self) {
        {
            let mut st = self.shared.lock();
            st.killed = true;
            st.queue.clear();
            st.events = None;
        }
        self.shared.notify.notify_one();
    }
}

// ── FIFO pool ────────────────────────────────────────────────────────

/// Push-based FIFO worker pool.
///
/// ```no_run
/// # use flowkit_pool::Pool;
/// # use flowkit_core::Completion;
/// # async fn demo() {
/// let pool = Pool::builder(|url: String, done: Completion<u16, String>| async move {
///     done.resolve(200);
/// })
/// .concurrency(4)
/// .build();
///
/// let receipt = pool.push("https://example.com/a".to_string()).unwrap();
/// assert_eq!(receipt.await.unwrap(), Ok(200));
/// # }
/// ```
pub struct Pool<V, R, E> {
    core: PoolCore<V, R, E>,
}

/// Builder for [`Pool`].
pub struct PoolBuilder<V, R, E> {
    worker: PoolWorker<V, R, E>,
    concurrency: usize,
    dispatch: Dispatch,
    hook: ViolationHook,
}

impl<V, R, E> Pool<V, R, E>
where
    V: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Start building a pool around a worker. The worker reports through
    /// its [`Completion`]; failures reach only the failed item's
    /// done-channel.
    pub fn builder<W, Fut>(worker: W) -> PoolBuilder<V, R, E>
    where
        W: FnMut(V, Completion<R, E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        PoolBuilder {
            worker: single_item_worker(worker),
            concurrency: 1,
            dispatch: Dispatch::default(),
            hook: ViolationHook::default(),
        }
    }

    /// Enqueue at the back of the queue.
    pub fn push(&self, value: V) -> Result<DoneReceiver<R, E>, PoolError> {
        self.core.enqueue(value, 0, false)
    }

    /// Enqueue at the front of the queue.
    pub fn unshift(&self, value: V) -> Result<DoneReceiver<R, E>, PoolError> {
        self.core.enqueue(value, 0, true)
    }

    /// Items waiting in the queue.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently being processed.
    pub fn running(&self) -> usize {
        self.core.running()
    }

    /// Queue empty and nothing in flight.
    pub fn idle(&self) -> bool {
        self.core.idle()
    }

    pub fn concurrency(&self) -> usize {
        self.core.concurrency()
    }

    /// Retune the concurrency limit; a raise dispatches queued work
    /// immediately, in-flight tasks are never preempted. Clamped to at
    /// least 1.
    pub fn set_concurrency(&self, limit: usize) {
        self.core.set_concurrency(limit);
    }

    /// Override the unsaturation buffer (default: 25% of concurrency).
    pub fn set_unsaturated_buffer(&self, buffer: usize) {
        self.core.set_unsaturated_buffer(buffer);
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    /// Block new dispatch without discarding the queue.
    pub fn pause(&self) {
        self.core.pause();
    }

    /// Re-enter dispatch after a pause.
    pub fn resume(&self) {
        self.core.resume();
    }

    /// Discard queued items and detach notifications. In-flight tasks run
    /// to completion but their results are dropped.
    pub fn kill(&self) {
        self.core.kill();
    }

    /// Snapshot of the in-flight items.
    pub fn workers_list(&self) -> Vec<V> {
        self.core.workers_list()
    }

    /// Subscribe to lifecycle events, replacing any prior subscription.
    pub fn events(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.core.events()
    }
}

impl<V, R, E> PoolBuilder<V, R, E>
where
    V: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Concurrency limit (default: 1).
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    /// Dispatch timing policy for the backing run.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Where double-completion violations are reported.
    pub fn violation_hook(mut self, hook: ViolationHook) -> Self {
        self.hook = hook;
        self
    }

    pub fn build(self) -> Pool<V, R, E> {
        Pool {
            core: PoolCore::spawn(
                QueueKind::Fifo,
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

/// Adapt a one-item worker to the batched driver shape (batches of one).
pub(crate) fn single_item_worker<V, R, E, W, Fut>(mut worker: W) -> PoolWorker<V, R, E>
where
    W: FnMut(V, Completion<R, E>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |mut values, completion| match values.pop() {
        Some(value) => {
            let fut: BoxFuture<'static, ()> = Box::pin(worker(value, completion));
            fut
        }
        None => Box::pin(async {}),
    })
}

pub(crate) fn deliver_single<R, E>() -> DeliverFn<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    Arc::new(|mut callbacks, outcome| {
        if let Some(tx) = callbacks.pop() {
            let _ = tx.send(outcome);
        }
    })
}
