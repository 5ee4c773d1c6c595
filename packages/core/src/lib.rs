//! Clinical trial registry ingestion, deduplication, and patient matching
//! service. Orchestrates the registry adapters in `registries` behind a
//! durable job queue and auto-scaling worker pool.

pub mod config;
pub mod domains;
pub mod handlers;
pub mod kernel;

pub use config::Config;
