use thiserror::Error;

/// Errors surfaced by a registry adapter's `enumerate`/`fetch` calls.
/// Mirrors §7: transient network errors are retried inside the HTTP client
/// and never reach here; what does reach here is what the scraper engine
/// and worker need to decide retry vs fail vs alert.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry {registry} unavailable (last status: {last_status:?})")]
    Unavailable {
        registry: String,
        last_status: Option<u16>,
    },

    #[error("bulk file for {registry} not found at {expected_path}; operator action required")]
    ManualImportRequired {
        registry: String,
        expected_path: String,
    },

    #[error("request to {registry} failed: {0}")]
    Request(String, #[source] reqwest::Error),

    #[error("bulk archive for {registry} is malformed: {reason}")]
    MalformedArchive { registry: String, reason: String },
}

/// Per-record normalization failure (§7 "Upstream schema change").
#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("field `{field}` could not be normalized from raw value: {raw}")]
    Failed { field: String, raw: String },

    #[error("record has no usable native id, cannot derive trial_key")]
    MissingId,
}
