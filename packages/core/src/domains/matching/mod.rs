//! Matcher (§4.9): patient profile to trial ranking.

pub mod effects;
pub mod scoring;

pub use effects::Matcher;
pub use scoring::{PatientProfile, ScoredTrial, Urgency};
