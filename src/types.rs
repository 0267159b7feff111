//! Entity shapes and pipeline result types.
//!
//! Entities use opaque string refs and value equality. Classes carry raw
//! local time strings as extracted; the normalizer replaces them with
//! absolute UTC instants before anything reaches the sink.

use serde::{Deserialize, Serialize};

/// A gym operator. Identity anchor is `website_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub website_url: String,
}

/// A physical location under an organization. Identity is `name` within the org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub address: Option<String>,
    /// IANA zone name, e.g. `America/New_York`.
    pub iana_timezone: String,
}

/// A class as extracted from a page, times still raw local strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawClass {
    /// Location name this class belongs to, when the page says so.
    pub location_name: Option<String>,
    /// Class name, preserved verbatim (punctuation is meaningful).
    pub name: String,
    /// Raw local start string, e.g. `"Monday 6:00 PM"`.
    pub start_raw: String,
    /// Raw local end string when present.
    pub end_raw: Option<String>,
    pub instructor: Option<String>,
    pub spots_total: Option<u32>,
}

/// A class ready for persistence. Identity under a location is
/// `(start_instant_utc, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRow {
    pub location_ref: String,
    pub name: String,
    /// ISO-8601 UTC instant, e.g. `2026-02-09T23:00:00.000Z`.
    pub start_instant_utc: String,
    pub end_instant_utc: Option<String>,
    pub instructor: Option<String>,
    pub spots_total: Option<u32>,
}

/// Extraction output for one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub organization: Option<Organization>,
    pub locations: Vec<Location>,
    pub classes: Vec<RawClass>,
}

/// Which acquisition path produced a fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMethod {
    Light,
    Browser,
}

/// A compact directive from the validator for a single orchestrator retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryHint {
    PaginateForward,
    WaitLonger,
    SwitchToBrowser,
    ReAuthenticate,
}

/// Validator verdict for one extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorReport {
    pub valid: bool,
    /// Product of per-check factors, in `[0, 1]`.
    pub confidence: f64,
    pub signals: Vec<String>,
    pub retry_hint: Option<RetryHint>,
}

/// HTTP method of a replayable day pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Date shape observed in intercepted traffic, preserved so replays
/// substitute dates in the same format the site expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateFormat {
    /// `YYYY-MM-DD`
    Iso,
    /// `MM/DD/YYYY`
    UsSlash,
    /// 10-digit unix seconds
    EpochSeconds,
    /// 13-digit unix milliseconds
    EpochMillis,
}

/// A date-parameterised request template discovered from page traffic.
///
/// `{{date}}` marks the substitution point in the URL and/or body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayApiPattern {
    pub url_template: String,
    pub method: HttpMethod,
    /// Query parameter carrying the date, when the date rides the URL.
    pub date_param: Option<String>,
    /// JSON body with `{{date}}` substituted in, for POST patterns.
    pub body_template: Option<String>,
    /// Dotted paths of date-valued fields inside the body.
    pub body_date_paths: Vec<String>,
    /// Headers to replay, already filtered of hop-by-hop and cookie headers.
    pub headers: Vec<(String, String)>,
    pub date_format: DateFormat,
}

/// Outcome of one day replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayFetchResult {
    /// ISO date this replay targeted.
    pub date: String,
    pub status: u16,
    pub success: bool,
    pub body: Option<String>,
    pub error: Option<String>,
}

/// Navigation plan for a rendered page, from the planner collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub schedule_selector: Option<String>,
    pub next_button_selector: Option<String>,
    pub load_more_selector: Option<String>,
    pub auth_wall_detected: bool,
}

/// Authentication state of the scanning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    LoggedIn,
    LoggedOut,
    Unknown,
}

/// Result of a completed URL scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub organization_ref: String,
    pub location_refs: Vec<String>,
    pub classes_upserted: usize,
    /// Non-fatal conditions recorded along the way.
    pub warnings: Vec<String>,
    /// Per-day results when a discovered pattern was replayed.
    pub day_replay: Vec<DayFetchResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_hint_serialization() {
        let json = serde_json::to_string(&RetryHint::PaginateForward).unwrap();
        assert_eq!(json, "\"paginate-forward\"");
        let json = serde_json::to_string(&RetryHint::ReAuthenticate).unwrap();
        assert_eq!(json, "\"re-authenticate\"");
    }

    #[test]
    fn test_entity_value_equality() {
        let a = Organization {
            name: "Iron Temple".into(),
            website_url: "https://irontemple.example".into(),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
