//! Scraper subsystem (§4.5, §4.6): registry adapters are driven by
//! [`engine::ScraperEngine`] against the [`job::ScrapingJobRepository`]'s
//! bookkeeping.

pub mod engine;
pub mod job;

pub use engine::{ScraperEngine, ScraperError};
pub use job::{ScrapingJobRepository, ScrapingJobRow, ScrapingJobStatus, ScrapingJobType};
