//! Canonical trial storage: the `clinical_trials` table plus its two
//! satellite tables, `trial_embeddings` and `trial_duplicates` (§3, §6).

pub mod effects;
pub mod embedding;

pub use effects::TrialRepository;
pub use embedding::TrialEmbeddingRepository;
