//! Micro-batching of same-key calls.
//!
//! Callers enqueue one item each and await a oneshot. A queue flushes when it
//! reaches `max_batch_size` or after `max_wait` without a new arrival. At
//! most one flush per key runs at a time; items that arrive meanwhile are
//! picked up by the next cycle of the same flush task. A queue that drains
//! with no caller holding it is removed from the registry.

use crate::config::BatchPolicy;
use crate::error::ApiError;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type BatchFn<I, R> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<R>, ApiError>> + Send + Sync>;

type Registry = Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>;

struct Pending<I, R> {
    item: I,
    reply: oneshot::Sender<Result<R, ApiError>>,
}

struct QueueState<I, R> {
    items: Vec<Pending<I, R>>,
    processing: bool,
    /// Bumped on every arrival; an idle timer only fires for its own epoch.
    epoch: u64,
    policy: BatchPolicy,
    op: Option<BatchFn<I, R>>,
}

struct BatchQueue<I, R> {
    key: String,
    state: Mutex<QueueState<I, R>>,
    registry: Weak<Registry>,
}

impl<I, R> BatchQueue<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    fn new(key: &str, registry: Weak<Registry>) -> Self {
        Self {
            key: key.to_owned(),
            registry,
            state: Mutex::new(QueueState {
                items: Vec::new(),
                processing: false,
                epoch: 0,
                policy: BatchPolicy::default(),
                op: None,
            }),
        }
    }

    fn enqueue(self: &Arc<Self>, pending: Pending<I, R>, op: BatchFn<I, R>, policy: &BatchPolicy) {
        let mut state = self.state.lock();
        state.items.push(pending);
        state.op = Some(op);
        state.policy = policy.clone();
        state.epoch = state.epoch.wrapping_add(1);

        if state.processing {
            return;
        }
        if state.items.len() >= state.policy.max_batch_size.max(1) {
            state.processing = true;
            drop(state);
            tokio::spawn(Arc::clone(self).flush());
        } else {
            let epoch = state.epoch;
            let wait = state.policy.max_wait;
            drop(state);
            let queue = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(queue) = queue.upgrade() {
                    queue.flush_if_idle(epoch).await;
                }
            });
        }
    }

    async fn flush_if_idle(self: Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.processing || state.items.is_empty() {
                return;
            }
            state.processing = true;
        }
        self.flush().await;
    }

    /// Drain the queue in `max_batch_size` chunks until it is empty.
    async fn flush(self: Arc<Self>) {
        loop {
            let (batch, op) = {
                let mut state = self.state.lock();
                let take = state.items.len().min(state.policy.max_batch_size.max(1));
                let Some(op) = state.op.clone().filter(|_| take > 0) else {
                    state.processing = false;
                    drop(state);
                    self.release();
                    return;
                };
                (state.items.drain(..take).collect::<Vec<_>>(), op)
            };
            self.run(batch, &op).await;
        }
    }

    async fn run(&self, batch: Vec<Pending<I, R>>, op: &BatchFn<I, R>) {
        let size = batch.len();
        let (items, replies): (Vec<I>, Vec<_>) = batch.into_iter().map(|p| (p.item, p.reply)).unzip();
        tracing::debug!(key = %self.key, size, "flushing batch");

        let outcome = AssertUnwindSafe(async { op(items).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(key = %self.key, size, "batch operation panicked");
                Err(ApiError::ServiceClosed)
            });

        match outcome {
            Ok(results) if results.len() == size => {
                for (reply, result) in replies.into_iter().zip(results) {
                    if reply.send(Ok(result)).is_err() {
                        tracing::trace!(key = %self.key, "batch caller went away");
                    }
                }
            }
            Ok(results) => {
                let err = ApiError::BatchSizeMismatch {
                    expected: size,
                    actual: results.len(),
                };
                tracing::warn!(key = %self.key, error = %err, "batch operation returned wrong result count");
                reject_all(replies, &err);
            }
            Err(source) => {
                tracing::warn!(key = %self.key, size, error = %source, "batch operation failed");
                let err = ApiError::Batch {
                    size,
                    source: Arc::new(source),
                };
                reject_all(replies, &err);
            }
        }
    }

    /// Drop this queue from the registry when it is drained and nothing
    /// but the registry and the calling flush still own it.
    fn release(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut queues = registry.lock();
        let owned_here = queues.get(&self.key).is_some_and(|entry| {
            std::ptr::addr_eq(Arc::as_ptr(entry), std::ptr::from_ref(self)) && Arc::strong_count(entry) == 2
        });
        if !owned_here {
            return;
        }
        let idle = {
            let state = self.state.lock();
            state.items.is_empty() && !state.processing
        };
        if idle {
            queues.remove(&self.key);
            tracing::trace!(key = %self.key, "idle batch queue released");
        }
    }
}

fn reject_all<R>(replies: Vec<oneshot::Sender<Result<R, ApiError>>>, err: &ApiError) {
    for reply in replies {
        if reply.send(Err(err.clone())).is_err() {
            tracing::trace!("batch caller went away");
        }
    }
}

/// Per-key batch queues. While a key has a live queue it is bound to the
/// item/result type pair that created it.
#[derive(Default)]
pub struct Batcher {
    queues: Arc<Registry>,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("keys", &self.queues.lock().len())
            .finish()
    }
}

impl Batcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `item` to the queue for `key` and wait for its positional result.
    ///
    /// The latest `op` and `policy` passed for a key are the ones used by
    /// its next flush. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// `ApiError::Batch` when the flush failed, `ApiError::BatchSizeMismatch`
    /// when `op` returned the wrong number of results,
    /// `ApiError::InvalidRequest` when `key` is already bound to other types.
    pub async fn execute<I, R, F, Fut>(
        &self,
        key: &str,
        item: I,
        op: F,
        policy: &BatchPolicy,
    ) -> Result<R, ApiError>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, ApiError>> + Send + 'static,
    {
        let queue = self.queue::<I, R>(key)?;
        let op: BatchFn<I, R> = Arc::new(move |items: Vec<I>| op(items).boxed());
        let (reply, rx) = oneshot::channel();
        queue.enqueue(Pending { item, reply }, op, policy);
        // the flush task decides when the queue can be released
        drop(queue);
        rx.await.map_err(|_| ApiError::ServiceClosed)?
    }

    /// Number of items waiting for `key`, 0 when unknown or bound to other types.
    #[must_use]
    pub fn pending<I, R>(&self, key: &str) -> usize
    where
        I: Send + 'static,
        R: Send + 'static,
    {
        let queues = self.queues.lock();
        queues
            .get(key)
            .and_then(|entry| Arc::clone(entry).downcast::<BatchQueue<I, R>>().ok())
            .map_or(0, |queue| queue.state.lock().items.len())
    }

    /// Number of batch keys that currently have a live queue.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.queues.lock().len()
    }

    fn queue<I, R>(&self, key: &str) -> Result<Arc<BatchQueue<I, R>>, ApiError>
    where
        I: Send + 'static,
        R: Send + 'static,
    {
        let mut queues = self.queues.lock();
        let entry = queues
            .entry(key.to_owned())
            .or_insert_with(|| {
                Arc::new(BatchQueue::<I, R>::new(key, Arc::downgrade(&self.queues))) as Arc<dyn Any + Send + Sync>
            });
        Arc::clone(entry)
            .downcast::<BatchQueue<I, R>>()
            .map_err(|_| {
                ApiError::InvalidRequest(format!(
                    "batch key '{key}' is already used with other item or result types"
                ))
            })
    }
}
