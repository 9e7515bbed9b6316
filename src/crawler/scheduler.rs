use anyhow::Result;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::crawler::task::{Priority, ScrapeTask};

/// A pending task as reported by [`ScrapeTaskQueue::status`]
#[derive(Debug, Clone, Serialize)]
pub struct PendingTask {
    pub id: String,
    pub priority: Priority,
    pub waiting: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub current_task: Option<String>,
    pub tasks: Vec<PendingTask>,
}

#[derive(Default)]
struct QueueState {
    /// Sorted by priority, stable by enqueue order
    pending: Vec<ScrapeTask>,
    current: Option<String>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    poll_interval: Duration,
    started: AtomicBool,
}

/// Single-worker priority queue for scrape jobs.
///
/// One task runs at a time. A failing or panicking task is logged and the
/// worker moves on to the next one.
#[derive(Clone)]
pub struct ScrapeTaskQueue {
    inner: Arc<QueueInner>,
}

impl ScrapeTaskQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                poll_interval,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Add a task, replacing any pending task with the same id
    pub async fn enqueue<F, Fut>(&self, id: &str, priority: Priority, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = ScrapeTask {
            id: id.to_string(),
            priority,
            action: Box::new(move || action().boxed()),
            enqueued_at: Instant::now(),
        };

        let mut state = self.inner.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|t| t.id != id);
        if state.pending.len() != before {
            debug!("Replacing pending task {}", id);
        }

        state.pending.push(task);
        state.pending.sort_by_key(|t| t.priority);

        debug!(
            "Enqueued task {} ({:?}), {} pending",
            id,
            priority,
            state.pending.len()
        );
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let now = Instant::now();

        QueueStatus {
            queue_length: state.pending.len(),
            current_task: state.current.clone(),
            tasks: state
                .pending
                .iter()
                .map(|t| PendingTask {
                    id: t.id.clone(),
                    priority: t.priority,
                    waiting: now.saturating_duration_since(t.enqueued_at),
                })
                .collect(),
        }
    }

    /// Drop every pending task; a running task is left alone
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        let dropped = state.pending.len();
        state.pending.clear();
        info!("Cleared {} pending tasks", dropped);
    }

    /// True if the task is pending or currently running
    pub async fn is_queued(&self, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state.current.as_deref() == Some(id) || state.pending.iter().any(|t| t.id == id)
    }

    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.current.is_none() && state.pending.is_empty()
    }

    /// Resolve once nothing is pending or running
    pub async fn wait_idle(&self) {
        while !self.is_idle().await {
            sleep(self.inner.poll_interval).await;
        }
    }

    /// Spawn the worker loop. Only the first call starts a worker.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Task queue worker already running");
            return None;
        }

        let queue = self.clone();
        Some(tokio::spawn(async move {
            info!("Task queue worker started");
            loop {
                sleep(queue.inner.poll_interval).await;
                queue.run_next().await;
            }
        }))
    }

    async fn run_next(&self) {
        let task = {
            let mut state = self.inner.state.lock().await;
            if state.current.is_some() || state.pending.is_empty() {
                return;
            }
            let task = state.pending.remove(0);
            state.current = Some(task.id.clone());
            task
        };

        let id = task.id;
        let started = Instant::now();
        info!(
            "Running task {} ({:?}) after waiting {} ms",
            id,
            task.priority,
            started.saturating_duration_since(task.enqueued_at).as_millis()
        );

        let action = task.action;
        let outcome = AssertUnwindSafe(async move { action().await }).catch_unwind().await;
        let elapsed = started.elapsed().as_millis();

        match outcome {
            Ok(Ok(())) => info!("Task {} finished in {} ms", id, elapsed),
            Ok(Err(e)) => error!("Task {} failed after {} ms: {:#}", id, elapsed, e),
            Err(_) => error!("Task {} panicked after {} ms", id, elapsed),
        }

        self.inner.state.lock().await.current = None;
    }
}
