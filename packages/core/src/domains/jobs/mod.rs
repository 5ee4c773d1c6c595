//! Durable job queue and worker pool (§4.2, §4.3).

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{Job, JobStatus};
pub use queue::{JobQueueError, JobQueueStore};
pub use worker::{HandlerError, HandlerRegistry, JobHandler, Worker, WorkerConfig};
