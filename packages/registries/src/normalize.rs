//! Shared normalization helpers used by every adapter's `normalize()`.
//!
//! Kept here instead of duplicated per-adapter so the phase regex and age
//! parsing stay in exactly one place (§4.5 "Phase normalization", "Age
//! mapping").

use crate::model::{AgeBound, Phase, TrialStatus};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PHASE_1: Regex = Regex::new(r"(?i)^\s*(early[\s_-]?phase[\s_-]?1|phase[\s_-]?i\b)").unwrap();
    static ref PHASE_NUM: Regex = Regex::new(r"(?i)phase[\s_-]?0*([1-4])(?:[\s/_-]?0*([2-4]))?").unwrap();
    static ref ROMAN_PHASE: Regex =
        Regex::new(r"(?i)phase[\s_-]?(i{1,3}v?|iv)(?:[\s/_-]?(i{1,3}v?|iv))?\b").unwrap();
    static ref ISO_DURATION: Regex = Regex::new(r"(?i)^P(\d+)Y$").unwrap();
    static ref YEARS_TEXT: Regex = Regex::new(r"(?i)(\d+)\s*year").unwrap();
    static ref MONTHS_TEXT: Regex = Regex::new(r"(?i)(\d+)\s*month").unwrap();
    static ref DAYS_TEXT: Regex = Regex::new(r"(?i)(\d+)\s*day").unwrap();
    static ref WEEKS_TEXT: Regex = Regex::new(r"(?i)(\d+)\s*week").unwrap();
}

/// Normalizes a registry's free-text phase value onto the canonical set
/// `{EARLY_PHASE_1, PHASE_1, PHASE_2, PHASE_2_3, PHASE_3, PHASE_4, NA}` via
/// regex (§4.5: "Phase I", "phase 1", "PHASE1", roman numerals).
pub fn parse_phase(raw: &str) -> Phase {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") || trimmed.eq_ignore_ascii_case("na")
    {
        return Phase::Na;
    }
    if PHASE_1.is_match(trimmed) {
        return if trimmed.to_lowercase().contains("early") {
            Phase::EarlyPhase1
        } else {
            Phase::Phase1
        };
    }
    if let Some(caps) = PHASE_NUM.captures(trimmed) {
        let first = caps.get(1).map(|m| m.as_str());
        let second = caps.get(2).map(|m| m.as_str());
        return match (first, second) {
            (Some("1"), None) => Phase::Phase1,
            (Some("2"), Some("3")) => Phase::Phase2_3,
            (Some("2"), None) => Phase::Phase2,
            (Some("3"), None) => Phase::Phase3,
            (Some("4"), None) => Phase::Phase4,
            _ => Phase::Na,
        };
    }
    if let Some(caps) = ROMAN_PHASE.captures(trimmed) {
        let first = caps.get(1).map(|m| m.as_str().to_uppercase());
        let second = caps.get(2).map(|m| m.as_str().to_uppercase());
        return match (first.as_deref(), second.as_deref()) {
            (Some("II"), Some("III")) => Phase::Phase2_3,
            (Some(_), Some(_)) => Phase::Na,
            (Some("I"), None) => Phase::Phase1,
            (Some("II"), None) => Phase::Phase2,
            (Some("III"), None) => Phase::Phase3,
            (Some("IV"), None) => Phase::Phase4,
            _ => Phase::Na,
        };
    }
    Phase::Na
}

/// Maps a registry's native status vocabulary onto the canonical enum,
/// falling back to `Unknown` for anything not recognized (§4.5 "Status
/// mapping": unknown values never fail normalization).
pub fn map_status(raw: &str) -> TrialStatus {
    let normalized = raw.trim().to_lowercase().replace(['_', '-'], " ");
    match normalized.as_str() {
        "recruiting" | "open" | "open for recruitment" => TrialStatus::Recruiting,
        "not yet recruiting" | "not recruiting yet" | "pending" => TrialStatus::NotYetRecruiting,
        "active not recruiting" | "active, not recruiting" | "ongoing" => {
            TrialStatus::ActiveNotRecruiting
        }
        "completed" | "complete" | "closed" => TrialStatus::Completed,
        "suspended" | "temporarily halted" => TrialStatus::Suspended,
        "terminated" | "stopped early" | "prematurely ended" => TrialStatus::Terminated,
        "withdrawn" => TrialStatus::Withdrawn,
        _ => TrialStatus::Unknown,
    }
}

/// Parses an ISO-8601-ish duration (`"P18Y"`) or English free text
/// (`"18 Years"`, `"6 Months"`) into a day count, preserving the original
/// string for audit per §3's `AgeBound`.
pub fn parse_age(raw: &str) -> Option<AgeBound> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        return None;
    }
    if let Some(caps) = ISO_DURATION.captures(trimmed) {
        let years: i64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(AgeBound {
            days: years * 365,
            original: trimmed.to_string(),
        });
    }
    let mut days = 0i64;
    let mut matched = false;
    if let Some(caps) = YEARS_TEXT.captures(trimmed) {
        days += caps.get(1)?.as_str().parse::<i64>().ok()? * 365;
        matched = true;
    }
    if let Some(caps) = MONTHS_TEXT.captures(trimmed) {
        days += caps.get(1)?.as_str().parse::<i64>().ok()? * 30;
        matched = true;
    }
    if let Some(caps) = WEEKS_TEXT.captures(trimmed) {
        days += caps.get(1)?.as_str().parse::<i64>().ok()? * 7;
        matched = true;
    }
    if let Some(caps) = DAYS_TEXT.captures(trimmed) {
        days += caps.get(1)?.as_str().parse::<i64>().ok()?;
        matched = true;
    }
    if !matched {
        return None;
    }
    Some(AgeBound {
        days,
        original: trimmed.to_string(),
    })
}

/// Splits a registry's delimited free-text field into an array of trimmed,
/// non-empty strings. The delimiter is chosen per-registry (§9 open
/// question: EU CTR/CTIS use `;`, ISRCTN uses `,`); already-array fields are
/// passed through untouched by callers and never reach this function.
pub fn split_list(raw: &str, delimiter: char) -> Vec<String> {
    raw.split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roman_and_arabic_phases() {
        assert_eq!(parse_phase("Phase I"), Phase::Phase1);
        assert_eq!(parse_phase("phase 1"), Phase::Phase1);
        assert_eq!(parse_phase("PHASE1"), Phase::Phase1);
        assert_eq!(parse_phase("Phase II/III"), Phase::Phase2_3);
        assert_eq!(parse_phase("Phase IV"), Phase::Phase4);
        assert_eq!(parse_phase("Early Phase 1"), Phase::EarlyPhase1);
        assert_eq!(parse_phase(""), Phase::Na);
        assert_eq!(parse_phase("not applicable"), Phase::Na);
    }

    #[test]
    fn unknown_status_falls_back_to_unknown_not_error() {
        assert_eq!(map_status("Recruiting"), TrialStatus::Recruiting);
        assert_eq!(map_status("some-new-status-value"), TrialStatus::Unknown);
    }

    #[test]
    fn parses_iso_duration_and_free_text_ages() {
        assert_eq!(parse_age("P18Y").unwrap().days, 18 * 365);
        assert_eq!(parse_age("65 Years").unwrap().days, 65 * 365);
        assert_eq!(parse_age("6 Months").unwrap().days, 180);
        assert!(parse_age("N/A").is_none());
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            split_list("diabetes; , obesity ;;hypertension", ';'),
            vec!["diabetes", ", obesity", "hypertension"]
        );
    }
}
