//! Size- and time-triggered batching queue.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::trace;

/// Callback that processes one batch.
pub type BatchProcessor<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Coalesces queued items into batches.
///
/// A batch is processed `delay` after the queue becomes non-empty, or right
/// away once `capacity` items are waiting. Batches are handed to the
/// processor in FIFO order, at most `capacity` items at a time, and the
/// processor never runs concurrently with itself.
pub struct Batcher<T> {
    inner: Arc<BatcherInner<T>>,
}

struct BatcherInner<T> {
    capacity: usize,
    delay: Duration,
    runtime: Handle,
    processor: BatchProcessor<T>,
    state: Mutex<BatcherState<T>>,
    processing: tokio::sync::Mutex<()>,
}

struct BatcherState<T> {
    queue: VecDeque<T>,
    /// Token of the pending delayed trigger; replaced or cleared to cancel it.
    scheduled: Option<u64>,
    next_token: u64,
    closed: bool,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher that spawns its work on `runtime`.
    pub fn new(
        capacity: usize,
        delay: Duration,
        runtime: Handle,
        processor: BatchProcessor<T>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                capacity: capacity.max(1),
                delay,
                runtime,
                processor,
                state: Mutex::new(BatcherState {
                    queue: VecDeque::new(),
                    scheduled: None,
                    next_token: 0,
                    closed: false,
                }),
                processing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Queues a single item.
    pub fn queue_object(&self, item: T) {
        self.queue_objects(std::iter::once(item));
    }

    /// Queues several items.
    pub fn queue_objects<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.queue.extend(items);
        if state.queue.is_empty() {
            return;
        }

        if state.queue.len() >= self.inner.capacity {
            state.scheduled = None;
            drop(state);
            self.inner.spawn_processing();
        } else if state.scheduled.is_none() {
            self.inner.schedule(&mut state);
        }
    }

    /// Processes everything queued, without waiting for the delay.
    pub async fn flush(&self) {
        self.inner.state.lock().scheduled = None;
        let _guard = self.inner.processing.lock().await;
        loop {
            let batch = self.inner.take_batch();
            if batch.is_empty() {
                break;
            }
            trace!(count = batch.len(), "flushing batch");
            (self.inner.processor)(batch).await;
        }
    }

    /// Number of queued items.
    pub fn count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Drops queued items and refuses new ones. Returns the number dropped.
    pub fn close(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.scheduled = None;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }
}

impl<T: Send + 'static> BatcherInner<T> {
    fn schedule(self: &Arc<Self>, state: &mut BatcherState<T>) {
        state.next_token += 1;
        let token = state.next_token;
        state.scheduled = Some(token);

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(inner.delay).await;
            {
                let mut state = inner.state.lock();
                if state.scheduled != Some(token) {
                    return;
                }
                state.scheduled = None;
            }
            inner.process_next().await;
        });
    }

    fn spawn_processing(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move { inner.process_next().await });
    }

    fn take_batch(&self) -> Vec<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let count = state.queue.len().min(self.capacity);
        state.queue.drain(..count).collect()
    }

    async fn process_next(self: Arc<Self>) {
        let guard = self.processing.lock().await;
        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }
        trace!(count = batch.len(), "processing batch");
        (self.processor)(batch).await;
        drop(guard);

        let mut state = self.state.lock();
        if state.closed || state.queue.is_empty() {
            return;
        }
        if state.queue.len() >= self.capacity {
            drop(state);
            self.spawn_processing();
        } else if state.scheduled.is_none() {
            self.schedule(&mut state);
        }
    }
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
