//! Orchestrator (§4.4): bootstraps the worker pool, auto-scales it against
//! queue load, runs the fixed daily schedule, and supervises worker tasks.
//! Grounded on the reference service's `scheduled_tasks::start_scheduler`
//! for the `tokio_cron_scheduler` wiring; the auto-scale loop and worker
//! pool have no direct teacher counterpart (the reference service runs a
//! fixed worker count) and are built fresh from §4.4's formula.

mod pool;
mod schedule;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domains::jobs::{HandlerRegistry, JobQueueStore};
use crate::domains::monitoring::Monitor;

pub use pool::WorkerPool;

const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(30);
const SCALE_UP_LOAD: f64 = 50.0;
const SCALE_DOWN_LOAD: f64 = 10.0;
const SCALE_DOWN_FRACTION: f64 = 0.20;

pub struct OrchestratorConfig {
    pub queues: Vec<String>,
    pub visibility_timeout: Duration,
    pub worker_min: usize,
    pub worker_max: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<JobQueueStore>,
    db_pool: PgPool,
    pool: WorkerPool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, queue: Arc<JobQueueStore>, db_pool: PgPool, handlers: HandlerRegistry) -> Self {
        let pool = WorkerPool::new(queue.clone(), handlers, config.queues.clone(), config.visibility_timeout);
        Self { config, queue, db_pool, pool }
    }

    /// Bootstraps `worker_min` workers, then runs the auto-scale loop, the
    /// fixed daily schedule, and (if given) the monitoring loops, until
    /// `shutdown` is cancelled. Returns once every spawned piece has wound
    /// down, satisfying graceful shutdown (§4.3/§5).
    pub async fn run(
        &self,
        monitor: Option<Arc<Monitor>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        self.pool.bootstrap(self.config.worker_min).await;
        info!(workers = self.config.worker_min, "orchestrator bootstrapped worker pool");

        let mut tasks = Vec::new();

        let autoscale_pool = self.pool.clone();
        let autoscale_queue = self.queue.clone();
        let (min, max) = (self.config.worker_min, self.config.worker_max);
        let autoscale_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            autoscale_loop(autoscale_pool, autoscale_queue, min, max, autoscale_shutdown).await;
        }));

        let schedule_queue = self.queue.clone();
        let schedule_pool = self.db_pool.clone();
        let schedule_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = schedule::run(schedule_queue, schedule_pool, schedule_shutdown).await {
                tracing::error!(error = %e, "scheduled task runner exited with an error");
            }
        }));

        if let Some(monitor) = monitor {
            let monitor_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                monitor.run(monitor_shutdown).await;
            }));
        }

        shutdown.cancelled().await;
        self.pool.shutdown().await;
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn queue(&self) -> &Arc<JobQueueStore> {
        &self.queue
    }
}

/// §4.4's auto-scaling formula, checked every 30s: `load = pending /
/// max(workers, 1)`; scale up by `ceil(load/50)` past 50, scale down 20%
/// below 10, clamped to `[min, max]`.
async fn autoscale_loop(pool: WorkerPool, queue: Arc<JobQueueStore>, min: usize, max: usize, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(AUTOSCALE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let pending = match queue.pending_count(None).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "autoscale: failed to read pending count");
                continue;
            }
        };
        let workers = pool.size().await.max(1);
        let load = pending as f64 / workers as f64;

        if load > SCALE_UP_LOAD && workers < max {
            let add = (load / SCALE_UP_LOAD).ceil() as usize;
            let target = (workers + add).min(max);
            info!(pending, workers, target, "autoscale: scaling up");
            pool.scale_to(target).await;
        } else if load < SCALE_DOWN_LOAD && workers > min {
            let drop = ((workers as f64) * SCALE_DOWN_FRACTION).ceil() as usize;
            let target = workers.saturating_sub(drop.max(1)).max(min);
            if target < workers {
                info!(pending, workers, target, "autoscale: scaling down");
                pool.scale_to(target).await;
            }
        }
    }
}
