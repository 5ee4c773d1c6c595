use crate::error::{NormalizationError, RegistryError};
use crate::model::{CanonicalTrial, Registry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque resumption token. Each adapter picks the variant matching its own
/// enumeration strategy (§4.5); the scraper engine never inspects the
/// contents, only persists and replays it verbatim via the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// ClinicalTrials.gov: opaque `nextPageToken`.
    PageToken(String),
    /// ISRCTN: fixed page size, 1-indexed page number.
    Page(u32),
    /// CTIS: running offset into the result set.
    Offset(u64),
    /// EU CTR / WHO ICTRP: byte offset into the currently-open bulk file,
    /// plus the file's identifying name so a rotated drop is detected.
    BulkFile { file_name: String, record_offset: u64 },
}

/// A raw, un-normalized record as handed back by `enumerate`/`fetch`,
/// carried as an opaque JSON blob until `normalize` interprets it. Keeping
/// `raw` around (not just the normalized trial) is what lets
/// `CanonicalTrial::raw_data` satisfy the "never edited, preserved verbatim"
/// invariant in §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub native_id: String,
    pub raw: serde_json::Value,
}

pub struct EnumeratePage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<Cursor>,
    pub total_estimate: Option<u64>,
}

/// Common contract every registry adapter implements (§4.5). Per-registry
/// quirks (HTTP shapes, bulk-file parsing, field name drift) live entirely
/// inside the adapter and never leak through this trait.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    fn registry(&self) -> Registry;

    /// Lazy, resumable enumeration. `cursor = None` starts from the
    /// adapter's initial position.
    async fn enumerate(&self, cursor: Option<Cursor>) -> Result<EnumeratePage, RegistryError>;

    /// Optional detail fetch for list-then-detail registries. Adapters that
    /// return complete records from `enumerate` may leave this as a no-op
    /// that echoes the input.
    async fn fetch(&self, native_id: &str) -> Result<RawRecord, RegistryError>;

    /// Pure function: produces a complete `CanonicalTrial` with `source`
    /// set and `external_ids` populated with every secondary identifier
    /// observed in the raw record (§4.5 "Cross-registry ID extraction").
    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalTrial, NormalizationError>;

    fn trial_key(&self, native_id: &str) -> String {
        format!("{:?}:{}", self.registry(), native_id).to_lowercase()
    }

    /// Starting cursor for a date-windowed query over `[start, end)`, used by
    /// the scraper engine's fallback sweep (§4.6 step 3) to catch records a
    /// cursor gap missed. Registries whose API has no last-modified filter
    /// return `None`, which the engine treats as "no sweep for this adapter"
    /// rather than an error.
    fn date_window_cursor(
        &self,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> Option<Cursor> {
        None
    }
}

/// The HTTP seam every adapter calls through instead of owning a
/// `reqwest::Client` directly. The core crate's rate-limited client (§4.1)
/// implements this; adapters never see token-bucket or backoff state, per
/// the "global mutable rate-limit counters" redesign note in §9.
#[async_trait]
pub trait RateLimitedHttp: Send + Sync {
    async fn get_json(
        &self,
        registry: Registry,
        url: &str,
    ) -> Result<serde_json::Value, RegistryError>;

    async fn get_text(&self, registry: Registry, url: &str) -> Result<String, RegistryError>;

    async fn get_bytes(&self, registry: Registry, url: &str) -> Result<Vec<u8>, RegistryError>;
}

/// Where a bulk-file adapter (EU CTR, WHO ICTRP) looks for operator-dropped
/// exports, per §4.5's "Bulk file" enumeration strategy.
#[derive(Debug, Clone)]
pub struct BulkDropDirectory {
    pub path: PathBuf,
}

impl BulkDropDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}
