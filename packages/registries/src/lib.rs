//! Registry adapter contract and the five registry adapters (§4.5).
//!
//! Each adapter is a pure, self-contained translation from a registry's
//! native wire shape to [`model::CanonicalTrial`]. Per-registry quirks never
//! leak past [`adapter::RegistryAdapter`].

pub mod adapter;
pub mod ctgov;
pub mod ctis;
pub mod error;
pub mod euctr;
pub mod ictrp;
pub mod isrctn;
pub mod model;
pub mod normalize;

pub use adapter::{BulkDropDirectory, Cursor, EnumeratePage, RateLimitedHttp, RawRecord, RegistryAdapter};
pub use error::{NormalizationError, RegistryError};
pub use model::{
    AgeBound, CanonicalTrial, Eligibility, Gender, Intervention, Phase, Registry, Sponsor,
    TrialContact, TrialLocation, TrialStatus,
};
