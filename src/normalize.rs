//! Raw local time strings → absolute UTC instants.
//!
//! Schedule pages say things like `"Monday 6:00 PM"` or `"18:30"`. This
//! module resolves the calendar date in the gym's IANA zone, parses the time
//! token, and emits an ISO-8601 UTC instant. Already-normalized instants
//! pass through unchanged, so normalization is idempotent.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::OnceLock;

/// Output instant format: millisecond precision, `Z` suffix.
const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Normalization failure. The caller keeps the raw value and records a
/// warning; these never abort a scan.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("unknown IANA timezone: {0}")]
    UnknownTimezone(String),
    #[error("no recognized time shape in {0:?}")]
    NoTimeToken(String),
    #[error("time {0:?} does not exist in the target zone")]
    InvalidLocalTime(String),
}

/// A normalized instant plus an optional soft warning (e.g. an unrecognized
/// day word that fell back to the reference date).
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// ISO-8601 UTC instant.
    pub instant: String,
    pub warning: Option<String>,
}

fn day_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|wed|thu|fri|sat|sun|today|tomorrow)\b",
        )
        .expect("day token regex is valid")
    })
}

fn meridiem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Covers "6:00 PM", "6:00PM", "6 pm", "6pm".
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*([ap])\.?m\.?").expect("12h regex is valid")
    })
}

fn twenty_four_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2}):(\d{2})\b").expect("24h regex is valid"))
}

/// Normalize a raw local time string in `tz`, resolving relative day words
/// against `reference`.
///
/// Accepted time shapes: `H[:MM] AM|PM`, `H[:MM]AM|PM`, `HH:MM` (24-hour).
/// Day words: full day names, 3-letter abbreviations, `today`, `tomorrow`.
/// A day name resolves to the nearest forthcoming occurrence including the
/// reference day itself.
pub fn normalize(raw: &str, tz: &str, reference: DateTime<Utc>) -> Result<Normalized, NormalizeError> {
    let trimmed = raw.trim();

    // Idempotence: an already-absolute instant passes through canonicalized.
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Normalized {
            instant: dt.with_timezone(&Utc).format(UTC_FORMAT).to_string(),
            warning: None,
        });
    }

    let zone: Tz = tz
        .parse()
        .map_err(|_| NormalizeError::UnknownTimezone(tz.to_string()))?;

    let (hour, minute, time_span) = parse_time_token(trimmed)
        .ok_or_else(|| NormalizeError::NoTimeToken(trimmed.to_string()))?;

    let local_ref = reference.with_timezone(&zone).date_naive();
    let (date, warning) = resolve_date(trimmed, time_span, local_ref);

    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| NormalizeError::InvalidLocalTime(trimmed.to_string()))?;

    // DST gap: shift forward an hour and take the earliest valid mapping.
    let local = match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match zone.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
                LocalResult::None => {
                    return Err(NormalizeError::InvalidLocalTime(trimmed.to_string()))
                }
            }
        }
    };

    Ok(Normalized {
        instant: local.with_timezone(&Utc).format(UTC_FORMAT).to_string(),
        warning,
    })
}

/// Extract `(hour24, minute, matched_span)` from the first recognized time
/// token. Meridiem shapes take priority so `"6:00 PM"` is not misread as a
/// 24-hour `6:00`.
fn parse_time_token(text: &str) -> Option<(u32, u32, (usize, usize))> {
    if let Some(caps) = meridiem_re().captures(text) {
        let whole = caps.get(0)?;
        let h: u32 = caps.get(1)?.as_str().parse().ok()?;
        let m: u32 = caps.get(2).map_or(Some(0), |c| c.as_str().parse().ok())?;
        if !(1..=12).contains(&h) || m > 59 {
            return None;
        }
        let pm = caps.get(3)?.as_str().eq_ignore_ascii_case("p");
        let hour24 = match (h, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, false) => h,
            (h, true) => h + 12,
        };
        return Some((hour24, m, (whole.start(), whole.end())));
    }

    if let Some(caps) = twenty_four_re().captures(text) {
        let whole = caps.get(0)?;
        let h: u32 = caps.get(1)?.as_str().parse().ok()?;
        let m: u32 = caps.get(2)?.as_str().parse().ok()?;
        if h > 23 || m > 59 {
            return None;
        }
        return Some((h, m, (whole.start(), whole.end())));
    }

    None
}

/// Resolve the calendar date from the day word, if any.
///
/// `today` or no day word → the reference date; `tomorrow` → +1 day; a day
/// name → `(target − current + 7) mod 7` days ahead (0 when today matches);
/// any other word → reference date with a warning.
fn resolve_date(
    text: &str,
    time_span: (usize, usize),
    local_ref: NaiveDate,
) -> (NaiveDate, Option<String>) {
    if let Some(m) = day_token_re().find(text) {
        let token = m.as_str().to_lowercase();
        return match token.as_str() {
            "today" => (local_ref, None),
            "tomorrow" => (local_ref + Duration::days(1), None),
            _ => {
                let target = weekday_for(&token).expect("regex only matches known day tokens");
                let current = local_ref.weekday();
                let offset = (target.num_days_from_monday() + 7 - current.num_days_from_monday()) % 7;
                (local_ref + Duration::days(i64::from(offset)), None)
            }
        };
    }

    // No day token. Any leftover alphabetic word outside the time span is an
    // unrecognized day word: fall back to the reference date and warn.
    let outside: String = text
        .char_indices()
        .filter(|(i, _)| *i < time_span.0 || *i >= time_span.1)
        .map(|(_, c)| c)
        .collect();
    let stray = outside
        .split_whitespace()
        .any(|w| w.chars().any(|c| c.is_ascii_alphabetic()));
    if stray {
        (
            local_ref,
            Some(format!("unrecognized day word in {text:?}, using reference date")),
        )
    } else {
        (local_ref, None)
    }
}

fn weekday_for(token: &str) -> Option<Weekday> {
    let day = match &token[..3.min(token.len())] {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}
