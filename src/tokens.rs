//! Schedule token heuristics shared by the fetch decision rule, the
//! extractor, and the validator.
//!
//! A "time-like token" is `6:00 PM`, `6pm`, or `18:30`. A "day-name token"
//! is a full or 3-letter English day name. Both are cheap signals that a
//! body actually carries a schedule rather than an app shell.

use regex::Regex;
use std::sync::OnceLock;

/// `6:00 PM`, `6:00PM`, `6pm`, `18:30`.
pub fn time_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b\d{1,2}(?::\d{2})?\s*[ap]\.?m\.?|\b\d{1,2}:\d{2}\b")
            .expect("time token regex is valid")
    })
}

/// Full day names and 3-letter abbreviations, word-bounded.
pub fn day_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tue|wed|thu|fri|sat|sun)\b",
        )
        .expect("day token regex is valid")
    })
}

pub fn has_time_token(text: &str) -> bool {
    time_token_re().is_match(text)
}

pub fn has_day_token(text: &str) -> bool {
    day_token_re().is_match(text)
}
