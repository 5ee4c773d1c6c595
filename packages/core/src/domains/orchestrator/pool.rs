//! Worker pool: spawns/cancels [`Worker`] tasks to match whatever target
//! size the auto-scale loop or `bootstrap` asks for.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domains::jobs::{HandlerRegistry, JobQueueStore, Worker, WorkerConfig};

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueueStore>,
    handlers: HandlerRegistry,
    queues: Vec<String>,
    visibility_timeout: Duration,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueueStore>,
        handlers: HandlerRegistry,
        queues: Vec<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            handlers,
            queues,
            visibility_timeout,
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn bootstrap(&self, count: usize) {
        self.scale_to(count).await;
    }

    pub async fn size(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Grows or shrinks the pool to exactly `target` workers. Shrinking
    /// cancels the most recently spawned workers first; each cancelled
    /// worker finishes whatever job it currently holds before exiting
    /// (§4.3), so this never drops in-flight work.
    pub async fn scale_to(&self, target: usize) {
        let mut workers = self.workers.lock().await;
        while workers.len() < target {
            let cancel = CancellationToken::new();
            let config = WorkerConfig::new(self.queues.clone(), self.visibility_timeout);
            let worker = Worker::new(config, self.queue.clone(), self.handlers.clone());
            let worker_cancel = cancel.clone();
            let join = tokio::spawn(async move {
                worker.run(worker_cancel).await;
            });
            workers.push(WorkerHandle { cancel, join });
        }
        while workers.len() > target {
            if let Some(handle) = workers.pop() {
                handle.cancel.cancel();
                tokio::spawn(async move {
                    let _ = handle.join.await;
                });
            }
        }
        info!(workers = workers.len(), "worker pool resized");
    }

    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            handle.cancel.cancel();
        }
        // Workers are allowed to finish their current job naturally; the
        // caller doesn't block on that here since a long-running handler
        // could otherwise stall process shutdown indefinitely.
    }
}
