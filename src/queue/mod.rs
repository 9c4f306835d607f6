//! Rate-limited work queue and handler chains
//!
//! Informer callbacks push [`Task`]s; a single consumer pops them in FIFO
//! order, throttled by a [`TokenBucket`]. A task whose handler fails is
//! retried after a fixed delay until it succeeds or the queue stops, so
//! handler invocations for one queue are totally ordered.

pub mod rate_limiter;

pub use rate_limiter::TokenBucket;

use crate::config::DiscoveryConfig;
use crate::k8s::ClusterObject;
use crate::metrics::DiscoveryMetrics;
use crate::Result;
use futures::future::{BoxFuture, FutureExt};
use kubedox_model::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Function applied to an object for a given event
pub type HandlerFn = Arc<dyn Fn(ClusterObject, Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(ClusterObject, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |obj, event| f(obj, event).boxed())
}

/// Unit of work: apply `handler` to `object` for `event`
#[derive(Clone)]
pub struct Task {
    handler: HandlerFn,
    object: ClusterObject,
    event: Event,
}

impl Task {
    pub fn new(handler: HandlerFn, object: ClusterObject, event: Event) -> Self {
        Self {
            handler,
            object,
            event,
        }
    }

    async fn run(&self) -> Result<()> {
        (self.handler)(self.object.clone(), self.event).await
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub error_delay: Duration,
    pub qps: f64,
    pub burst: u32,
    pub max_retries: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            error_delay: Duration::from_secs(1),
            qps: 10.0,
            burst: 100,
            max_retries: None,
        }
    }
}

impl From<&DiscoveryConfig> for QueueOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            error_delay: config.error_delay(),
            qps: config.queue_qps,
            burst: config.queue_burst,
            max_retries: config.max_task_retries,
        }
    }
}

pub struct Queue {
    tasks: Mutex<VecDeque<Task>>,
    ready: Notify,
    closing: AtomicBool,
    options: QueueOptions,
    limiter: TokenBucket,
    metrics: Option<DiscoveryMetrics>,
}

impl Queue {
    pub fn new(options: QueueOptions) -> Self {
        let limiter = TokenBucket::new(options.burst, options.qps);
        Self {
            tasks: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closing: AtomicBool::new(false),
            options,
            limiter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DiscoveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enqueue a task; silently dropped once the queue is closing
    pub fn push(&self, task: Task) {
        {
            let mut tasks = self.tasks.lock();
            if self.closing.load(Ordering::Acquire) {
                debug!("Queue closing, dropping {} task", task.object.kind());
                return;
            }
            tasks.push_back(task);
        }
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Consume tasks until `stop` fires
    pub async fn run(&self, stop: CancellationToken) {
        debug!(
            "Queue running at {} qps (burst {})",
            self.limiter.refill_rate(),
            self.limiter.capacity()
        );

        loop {
            let task = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                task = self.next() => task,
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }

            if !self.process(&task, &stop).await {
                break;
            }
        }

        {
            let _tasks = self.tasks.lock();
            self.closing.store(true, Ordering::Release);
        }
        info!("Work queue stopped");
    }

    async fn next(&self) -> Task {
        loop {
            let next = self.tasks.lock().pop_front();
            if let Some(task) = next {
                return task;
            }
            self.ready.notified().await;
        }
    }

    /// Run a task until it succeeds. Returns false if `stop` fired meanwhile.
    async fn process(&self, task: &Task, stop: &CancellationToken) -> bool {
        let mut failures: u32 = 0;

        loop {
            match task.run().await {
                Ok(()) => {
                    if let Some(m) = &self.metrics {
                        m.tasks_processed.inc();
                    }
                    return true;
                }
                Err(e) => {
                    failures += 1;

                    if let Some(max) = self.options.max_retries {
                        if failures > max {
                            error!(
                                kind = task.object.kind(),
                                key = %task.object.key(),
                                event = %task.event,
                                "Work item failed {} times ({}), dropping it",
                                failures,
                                e
                            );
                            if let Some(m) = &self.metrics {
                                m.tasks_dropped.inc();
                            }
                            return true;
                        }
                    }

                    error!(
                        kind = task.object.kind(),
                        key = %task.object.key(),
                        event = %task.event,
                        "Work item failed ({}), repeating after delay {:?}",
                        e,
                        self.options.error_delay
                    );
                    if let Some(m) = &self.metrics {
                        m.task_retries.inc();
                    }

                    tokio::select! {
                        _ = stop.cancelled() => return false,
                        _ = tokio::time::sleep(self.options.error_delay) => {}
                    }
                }
            }
        }
    }
}

/// Ordered list of handlers applied in sequence; the first error stops the
/// chain and is returned to the caller
#[derive(Default)]
pub struct ChainHandler {
    funcs: RwLock<Vec<HandlerFn>>,
}

impl ChainHandler {
    pub fn new(funcs: Vec<HandlerFn>) -> Self {
        Self {
            funcs: RwLock::new(funcs),
        }
    }

    /// Append a handler as the last one in the chain
    pub fn append(&self, handler: HandlerFn) {
        self.funcs.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.funcs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.read().is_empty()
    }

    pub async fn apply(&self, object: ClusterObject, event: Event) -> Result<()> {
        let funcs = self.funcs.read().clone();
        for f in funcs {
            f(object.clone(), event).await?;
        }
        Ok(())
    }

    /// The whole chain as a single handler, for use in a [`Task`]
    pub fn as_handler(self: &Arc<Self>) -> HandlerFn {
        let chain = Arc::clone(self);
        Arc::new(move |object, event| {
            let chain = Arc::clone(&chain);
            async move { chain.apply(object, event).await }.boxed()
        })
    }
}
