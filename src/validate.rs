//! Extraction validator: independent checks, multiplied confidence, and a
//! single retry hint.
//!
//! Each check that fires contributes a factor in (0, 1]; overall confidence
//! is the product and the result is valid at 0.5 or above. The first check
//! (in declaration order) that offers a retry hint wins. DOM-dependent
//! checks (pagination, auth wall) run on HTML captured from the live page
//! and are skipped when no live capture exists.

use crate::types::{RetryHint, ScrapeResult, ValidatorReport};
use scraper::{Html, Selector};
use std::collections::HashSet;

/// Characters that indicate markup bled into extracted class names.
const MARKUP_CHARS: &[char] = &['<', '>', '{', '}', '[', ']', '\\'];

/// Controls that advance a schedule view, matched against text, aria-label,
/// and title.
const PAGINATION_WORDS: &[&str] = &[
    "next", "forward", "tomorrow", "next day", "next week", "→", "›", "»",
];

/// Phrases that mark a login interstitial.
const LOGIN_PHRASES: &[&str] = &[
    "sign in",
    "log in",
    "enter your password",
    "authentication required",
];

/// Validate an extraction against independent page signals.
///
/// `live_dom` is HTML captured from the live page when the browser path was
/// used; `None` skips the page-dependent checks.
pub fn validate(result: &ScrapeResult, html: &str, live_dom: Option<&str>) -> ValidatorReport {
    let mut score = Scorecard::default();

    // 1. Count plausibility.
    let count = result.classes.len();
    if count == 0 {
        score.apply(0.1, "no classes extracted", Some(RetryHint::WaitLonger));
    } else if count < 3 {
        score.apply(
            0.5,
            format!("only {count} classes extracted"),
            Some(RetryHint::PaginateForward),
        );
    }

    // 2. Content coherence: markup characters inside class names.
    if count > 0 {
        let dirty = result
            .classes
            .iter()
            .filter(|c| c.name.chars().any(|ch| MARKUP_CHARS.contains(&ch)))
            .count();
        let ratio = dirty as f64 / count as f64;
        if ratio > 0.3 {
            score.apply(
                0.2,
                format!("{dirty}/{count} class names contain markup characters"),
                Some(RetryHint::SwitchToBrowser),
            );
        } else if dirty > 0 {
            score.apply(
                0.7,
                format!("{dirty}/{count} class names contain markup characters"),
                None,
            );
        }
    }

    // 3. Duplicate ratio over the (name, start) identity.
    if count > 0 {
        let unique: HashSet<(&str, &str)> = result
            .classes
            .iter()
            .map(|c| (c.name.as_str(), c.start_raw.as_str()))
            .collect();
        let ratio = unique.len() as f64 / count as f64;
        let signal = format!("duplicate-heavy extraction: {} unique of {count}", unique.len());
        if ratio < 0.3 {
            score.apply(0.2, signal, Some(RetryHint::WaitLonger));
        } else if ratio < 0.5 {
            score.apply(0.6, signal, None);
        }
    }

    // 4. Pagination state (page required): an enabled next-like control
    //    means more schedule exists beyond this view.
    if let Some(dom) = live_dom {
        if has_enabled_pagination_control(dom) {
            score.apply(
                0.7,
                "enabled pagination control present",
                Some(RetryHint::PaginateForward),
            );
        }
    }

    // 5. Auth wall: a live password input dominates; otherwise repeated
    //    login phrases in the HTML are a softer signal.
    let live_password = live_dom.map(has_password_input).unwrap_or(false);
    if live_password {
        score.apply(
            0.1,
            "password input present on live page",
            Some(RetryHint::ReAuthenticate),
        );
    } else if login_phrase_count(html) >= 2 {
        score.apply(
            0.4,
            "multiple login phrases in page text",
            Some(RetryHint::ReAuthenticate),
        );
    }

    score.into_report()
}

/// Running confidence product plus the first hint offered.
#[derive(Default)]
struct Scorecard {
    factors: Vec<f64>,
    signals: Vec<String>,
    retry_hint: Option<RetryHint>,
}

impl Scorecard {
    fn apply(&mut self, factor: f64, signal: impl Into<String>, hint: Option<RetryHint>) {
        self.factors.push(factor);
        self.signals.push(signal.into());
        if self.retry_hint.is_none() {
            self.retry_hint = hint;
        }
    }

    fn into_report(self) -> ValidatorReport {
        let confidence = self.factors.iter().product::<f64>();
        ValidatorReport {
            valid: confidence >= 0.5,
            confidence,
            signals: self.signals,
            retry_hint: self.retry_hint,
        }
    }
}

fn has_password_input(dom: &str) -> bool {
    let document = Html::parse_document(dom);
    Selector::parse("input[type=\"password\"]")
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn has_enabled_pagination_control(dom: &str) -> bool {
    let document = Html::parse_document(dom);
    let Ok(sel) = Selector::parse("a, button") else {
        return false;
    };

    for el in document.select(&sel) {
        let v = el.value();
        if v.attr("disabled").is_some()
            || v.attr("aria-disabled") == Some("true")
            || v.attr("class")
                .map(|c| c.to_lowercase().contains("disabled"))
                .unwrap_or(false)
        {
            continue;
        }

        let text = el.text().collect::<Vec<_>>().join(" ").to_lowercase();
        let aria = v.attr("aria-label").unwrap_or("").to_lowercase();
        let title = v.attr("title").unwrap_or("").to_lowercase();

        for word in PAGINATION_WORDS {
            if text.contains(word) || aria.contains(word) || title.contains(word) {
                return true;
            }
        }
    }
    false
}

fn login_phrase_count(html: &str) -> usize {
    let lower = html.to_lowercase();
    LOGIN_PHRASES
        .iter()
        .filter(|phrase| lower.contains(*phrase))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawClass;

    fn class(name: &str, start: &str) -> RawClass {
        RawClass {
            location_name: None,
            name: name.to_string(),
            start_raw: start.to_string(),
            end_raw: None,
            instructor: None,
            spots_total: None,
        }
    }

    fn clean_result(n: usize) -> ScrapeResult {
        ScrapeResult {
            organization: None,
            locations: Vec::new(),
            classes: (0..n)
                .map(|i| class(&format!("Class {i}"), &format!("Monday {i}:00 PM")))
                .collect(),
        }
    }

    #[test]
    fn test_clean_extraction_scores_one() {
        let report = validate(&clean_result(5), "<html></html>", None);
        assert!(report.valid);
        assert_eq!(report.confidence, 1.0);
        assert!(report.signals.is_empty());
        assert!(report.retry_hint.is_none());
    }

    #[test]
    fn test_zero_classes_scores_exactly_point_one() {
        let report = validate(&clean_result(0), "<html></html>", None);
        assert!(!report.valid);
        assert!((report.confidence - 0.1).abs() < f64::EPSILON);
        assert_eq!(report.retry_hint, Some(RetryHint::WaitLonger));
    }

    #[test]
    fn test_low_count_hints_pagination() {
        let report = validate(&clean_result(2), "<html></html>", None);
        // The 0.5 threshold is inclusive, so a lone low-count factor still
        // passes; the hint is carried regardless.
        assert!(report.valid);
        assert!((report.confidence - 0.5).abs() < 1e-9);
        assert_eq!(report.retry_hint, Some(RetryHint::PaginateForward));
    }

    #[test]
    fn test_markup_names_hint_browser() {
        let mut result = clean_result(0);
        for i in 0..4 {
            result.classes.push(class(&format!("<div>{i}</div>"), "Mon 6:00 PM"));
        }
        let report = validate(&result, "<html></html>", None);
        assert_eq!(report.retry_hint, Some(RetryHint::SwitchToBrowser));
        assert!(report.confidence <= 0.2);
    }

    #[test]
    fn test_few_markup_names_soft_penalty() {
        let mut result = clean_result(9);
        result.classes.push(class("<span>Yoga", "Mon 6:00 PM"));
        let report = validate(&result, "<html></html>", None);
        assert!((report.confidence - 0.7).abs() < 1e-9);
        assert!(report.valid);
        assert!(report.retry_hint.is_none());
    }

    #[test]
    fn test_duplicate_heavy_extraction() {
        let mut result = ScrapeResult::default();
        for _ in 0..10 {
            result.classes.push(class("Yoga", "Monday 6:00 PM"));
        }
        let report = validate(&result, "<html></html>", None);
        assert!((report.confidence - 0.2).abs() < 1e-9);
        assert_eq!(report.retry_hint, Some(RetryHint::WaitLonger));
    }

    #[test]
    fn test_pagination_control_detected() {
        let dom = r#"<html><body><button aria-label="Next week">›</button></body></html>"#;
        let report = validate(&clean_result(5), "<html></html>", Some(dom));
        assert!((report.confidence - 0.7).abs() < 1e-9);
        assert_eq!(report.retry_hint, Some(RetryHint::PaginateForward));
    }

    #[test]
    fn test_disabled_pagination_ignored() {
        let dom = r#"<html><body><button disabled>Next</button></body></html>"#;
        let report = validate(&clean_result(5), "<html></html>", Some(dom));
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn test_password_input_dominates() {
        let dom = r#"<html><body><form><input type="password" name="pw"/></form></body></html>"#;
        let report = validate(&clean_result(5), "<html></html>", Some(dom));
        assert!(!report.valid);
        assert!((report.confidence - 0.1).abs() < 1e-9);
        assert_eq!(report.retry_hint, Some(RetryHint::ReAuthenticate));
    }

    #[test]
    fn test_login_phrases_in_html() {
        let html = "<p>Please sign in or log in to view the schedule</p>";
        let report = validate(&clean_result(5), html, None);
        assert!((report.confidence - 0.4).abs() < 1e-9);
        assert_eq!(report.retry_hint, Some(RetryHint::ReAuthenticate));
    }

    #[test]
    fn test_first_hint_wins() {
        // Zero classes (WaitLonger) plus a pagination control: the count
        // check is earlier, so its hint is returned.
        let dom = r#"<html><body><a href="/next">Next day</a></body></html>"#;
        let report = validate(&clean_result(0), "<html></html>", Some(dom));
        assert_eq!(report.retry_hint, Some(RetryHint::WaitLonger));
        assert!((report.confidence - 0.07).abs() < 1e-9);
    }
}
