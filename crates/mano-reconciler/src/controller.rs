//! Controller runtime: workqueue with per-key serialization plus workers.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use mano_core::Result;

use crate::predicate;
use crate::store::{VnfStore, WatchEvent};

/// Outcome of one reconcile invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(duration),
        }
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &str) -> Result<ReconcileResult>;
}

/// Deduplicating workqueue. A key is never handed to two workers at once; a
/// key re-added while it is being processed is queued again when processing
/// finishes.
#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
}

pub struct Workqueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for Workqueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl Workqueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next key to process; blocks until one is available.
    pub async fn get(&self) -> String {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // cascade the wakeup to the next idle worker
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Finish processing a key; if it got dirty meanwhile it is re-queued.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Per-key error backoff, bounded.
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(500);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(300);

pub struct Controller {
    store: Arc<dyn VnfStore>,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<Workqueue>,
    workers: usize,
    cancel: CancellationToken,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Controller {
    pub fn new(
        store: Arc<dyn VnfStore>,
        reconciler: Arc<dyn Reconciler>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            reconciler,
            queue: Workqueue::new(),
            workers,
            cancel,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn queue(&self) -> Arc<Workqueue> {
        self.queue.clone()
    }

    /// Run the watch pump and worker pool until cancelled.
    pub async fn run(&self) {
        let mut tasks = Vec::new();

        // watch pump: filtered events become queue entries
        {
            let mut watch = self.store.watch();
            let queue = self.queue.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = watch.recv() => match event {
                            Ok(event) => {
                                if predicate::admits(&event) {
                                    queue.add(&event.key()).await;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "watch stream lagged; continuing");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        for worker in 0..self.workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            let cancel = self.cancel.clone();
            let failures = self.failures.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = cancel.cancelled() => break,
                        key = queue.get() => key,
                    };

                    let outcome = reconciler.reconcile(&key).await;
                    queue.done(&key).await;

                    match outcome {
                        Ok(result) => {
                            failures.lock().await.remove(&key);
                            if result.requeue {
                                queue.add(&key).await;
                            } else if let Some(after) = result.requeue_after {
                                Self::schedule(queue.clone(), cancel.clone(), key, after);
                            }
                        }
                        Err(err) => {
                            let attempt = {
                                let mut failures = failures.lock().await;
                                let entry = failures.entry(key.clone()).or_insert(0);
                                *entry += 1;
                                *entry
                            };
                            let backoff = error_backoff(attempt);
                            tracing::warn!(
                                worker,
                                key = %key,
                                attempt,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %err,
                                "reconcile failed; requeueing with backoff"
                            );
                            Self::schedule(queue.clone(), cancel.clone(), key, backoff);
                        }
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }

    /// Seed the queue with every existing resource (startup resync).
    pub async fn resync(&self) -> Result<()> {
        for vnf in self.store.list().await? {
            self.queue.add(&vnf.key()).await;
        }
        Ok(())
    }

    fn schedule(queue: Arc<Workqueue>, cancel: CancellationToken, key: String, after: Duration) {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => queue.add(&key).await,
            }
        });
    }
}

fn error_backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(10);
    (ERROR_BACKOFF_BASE * factor).min(ERROR_BACKOFF_MAX)
}
