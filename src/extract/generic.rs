//! Generic schedule extractor for raw HTML.
//!
//! This is the fallback extraction layer when no site-specific rule
//! matches. It walks candidate row elements using CSS selectors and, when
//! that yields nothing, runs a line-oriented scan over visible text pairing
//! day and time tokens with adjacent class names. Class names are preserved
//! verbatim; times stay as raw local strings until normalization.

use crate::tokens::{day_token_re, time_token_re};
use crate::types::{Organization, RawClass, ScrapeResult};
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use url::Url;

/// Row selectors tried in order; the first one that produces classes wins.
const ROW_SELECTORS: &[&str] = &[
    ".schedule-item",
    ".class-item",
    ".session",
    ".event",
    "table tr",
    "li",
];

fn instructor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:with|w/)\s+([A-Z][\w.'-]*(?:\s+[A-Z][\w.'-]*)?)")
            .expect("instructor regex is valid")
    })
}

fn spots_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{1,3})\s+spots?\b").expect("spots regex is valid"))
}

/// Extract a `ScrapeResult` from raw HTML.
pub fn extract(html: &str, url: &str) -> ScrapeResult {
    let document = Html::parse_document(html);

    let organization = Some(Organization {
        name: site_name(&document, url),
        website_url: url.to_string(),
    });

    let mut classes = rows_pass(&document);
    if classes.is_empty() {
        classes = line_scan_pass(&document);
    }

    ScrapeResult {
        organization,
        locations: Vec::new(),
        classes,
    }
}

/// Extract using an explicit selector set, for site-specific extractors.
/// Falls back to the generic passes when the selectors find nothing.
pub fn extract_with_selectors(
    html: &str,
    url: &str,
    row_selector: &str,
    name_selector: &str,
    time_selector: &str,
    staff_selector: &str,
) -> ScrapeResult {
    let document = Html::parse_document(html);

    let mut classes = Vec::new();
    if let (Ok(row_sel), Ok(name_sel), Ok(time_sel), Ok(staff_sel)) = (
        Selector::parse(row_selector),
        Selector::parse(name_selector),
        Selector::parse(time_selector),
        Selector::parse(staff_selector),
    ) {
        for row in document.select(&row_sel) {
            let name = row.select(&name_sel).next().map(|e| element_text(&e));
            let time = row.select(&time_sel).next().map(|e| element_text(&e));
            let staff = row.select(&staff_sel).next().map(|e| element_text(&e));

            let (Some(name), Some(time)) = (name, time) else {
                continue;
            };
            if name.is_empty() || !time_token_re().is_match(&time) {
                continue;
            }
            let day = day_token_re().find(&time).map(|m| m.as_str().to_string());
            let (start, end_raw) = split_time_range(&time);
            let start_raw = match day {
                Some(d) => format!("{d} {start}"),
                None => start,
            };
            classes.push(RawClass {
                location_name: None,
                name,
                start_raw,
                end_raw,
                instructor: staff.filter(|s| !s.is_empty()),
                spots_total: None,
            });
        }
    }

    if classes.is_empty() {
        return extract(html, url);
    }

    ScrapeResult {
        organization: Some(Organization {
            name: site_name(&document, url),
            website_url: url.to_string(),
        }),
        locations: Vec::new(),
        classes,
    }
}

// ── Row pass ─────────────────────────────────────────────────────────────────

fn rows_pass(document: &Html) -> Vec<RawClass> {
    for sel_str in ROW_SELECTORS {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        let mut found = Vec::new();
        for row in document.select(&sel) {
            let text = element_text(&row);
            // Row elements nest (tr inside li, etc.); keep rows short enough
            // to be a single schedule entry.
            if text.split_whitespace().count() > 30 {
                continue;
            }
            if let Some(class) = parse_schedule_line(&text, None) {
                found.push(class);
            }
        }
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

// ── Line scan pass ───────────────────────────────────────────────────────────

fn line_scan_pass(document: &Html) -> Vec<RawClass> {
    let text = body_text(document);
    let mut classes = Vec::new();
    let mut day_context: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // A line that is just a day name sets context for following lines.
        if let Some(m) = day_token_re().find(line) {
            if m.as_str().len() == line.len() {
                day_context = Some(m.as_str().to_string());
                continue;
            }
        }

        if let Some(class) = parse_schedule_line(line, day_context.as_deref()) {
            classes.push(class);
        }
    }
    classes
}

/// Parse one schedule line: a time token is required, everything else is
/// optional. Returns `None` when no class name remains after stripping the
/// schedule tokens.
fn parse_schedule_line(line: &str, day_context: Option<&str>) -> Option<RawClass> {
    let times: Vec<(usize, usize, String)> = time_token_re()
        .find_iter(line)
        .map(|m| (m.start(), m.end(), m.as_str().trim().to_string()))
        .collect();
    let (start_time, end_time) = match times.as_slice() {
        [] => return None,
        [start] => (start.2.clone(), None),
        [start, end, ..] => (start.2.clone(), Some(end.2.clone())),
    };

    let day = day_token_re()
        .find(line)
        .map(|m| m.as_str().to_string())
        .or_else(|| day_context.map(String::from));

    let instructor = instructor_re()
        .captures(line)
        .map(|c| c[1].trim().to_string());
    let spots_total = spots_re()
        .captures(line)
        .and_then(|c| c[1].parse::<u32>().ok());

    // The class name is what remains once schedule tokens are removed.
    let mut name = line.to_string();
    name = time_token_re().replace_all(&name, " ").to_string();
    name = day_token_re().replace_all(&name, " ").to_string();
    name = instructor_re().replace_all(&name, " ").to_string();
    name = spots_re().replace_all(&name, " ").to_string();
    let name = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| matches!(c, '-' | '–' | '•' | '|' | ',' | ':'))
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }

    let start_raw = match &day {
        Some(d) => format!("{d} {start_time}"),
        None => start_time,
    };
    let end_raw = end_time.map(|t| match &day {
        Some(d) => format!("{d} {t}"),
        None => t,
    });

    Some(RawClass {
        location_name: None,
        name,
        start_raw,
        end_raw,
        instructor,
        spots_total,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Organization name: `og:site_name`, then `<title>` up to the first
/// separator, then the host.
fn site_name(document: &Html, url: &str) -> String {
    if let Ok(sel) = Selector::parse("meta[property=\"og:site_name\"]") {
        if let Some(meta) = document.select(&sel).next() {
            if let Some(content) = meta.value().attr("content") {
                let content = content.trim();
                if !content.is_empty() {
                    return content.to_string();
                }
            }
        }
    }

    if let Ok(sel) = Selector::parse("title") {
        if let Some(title) = document.select(&sel).next() {
            let text = element_text(&title);
            let head = text
                .split(['|', '–', '—'])
                .next()
                .map(str::trim)
                .unwrap_or("");
            if !head.is_empty() {
                return head.to_string();
            }
        }
    }

    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}

fn element_text(el: &scraper::ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// All visible text, one line per block-ish element boundary.
fn body_text(document: &Html) -> String {
    let Ok(sel) = Selector::parse("body") else {
        return String::new();
    };
    let Some(body) = document.select(&sel).next() else {
        return String::new();
    };
    let mut out = String::new();
    for chunk in body.text() {
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            out.push_str(chunk);
            out.push('\n');
        }
    }
    out
}

/// Split `"6:00 PM - 7:00 PM"` into start and optional end.
fn split_time_range(time_text: &str) -> (String, Option<String>) {
    let mut matches = time_token_re().find_iter(time_text);
    let start = matches
        .next()
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| time_text.trim().to_string());
    let end = matches.next().map(|m| m.as_str().trim().to_string());
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_scan_three_days() {
        let html = r#"
        <html><head><title>Iron Temple | Schedule</title></head><body>
            <p>Monday 6:00 PM Yoga</p>
            <p>Wednesday 7:00 AM Spin</p>
            <p>Friday 12:00 PM HIIT Blast</p>
        </body></html>
        "#;
        let result = extract(html, "https://irontemple.example/schedule");
        assert_eq!(result.classes.len(), 3);
        assert_eq!(result.classes[0].name, "Yoga");
        assert_eq!(result.classes[0].start_raw, "Monday 6:00 PM");
        assert_eq!(result.classes[2].name, "HIIT Blast");
        assert_eq!(result.organization.as_ref().unwrap().name, "Iron Temple");
    }

    #[test]
    fn test_table_rows_with_instructor_and_spots() {
        let html = r#"
        <html><body><table>
            <tr><td>Tuesday</td><td>6:30 PM</td><td>Power Lifting</td><td>with Sam</td><td>12 spots</td></tr>
            <tr><td>Thursday</td><td>5:00 AM</td><td>Bootcamp</td><td>with Alex Lee</td><td>8 spots</td></tr>
        </table></body></html>
        "#;
        let result = extract(html, "https://x.example/");
        assert_eq!(result.classes.len(), 2);
        let first = &result.classes[0];
        assert_eq!(first.name, "Power Lifting");
        assert_eq!(first.start_raw, "Tuesday 6:30 PM");
        assert_eq!(first.instructor.as_deref(), Some("Sam"));
        assert_eq!(first.spots_total, Some(12));
    }

    #[test]
    fn test_time_range_yields_end() {
        let html = r#"
        <html><body>
            <p>Saturday 9:00 AM - 10:30 AM Open Gym</p>
        </body></html>
        "#;
        let result = extract(html, "https://x.example/");
        assert_eq!(result.classes.len(), 1);
        assert_eq!(result.classes[0].start_raw, "Saturday 9:00 AM");
        assert_eq!(result.classes[0].end_raw.as_deref(), Some("Saturday 10:30 AM"));
    }

    #[test]
    fn test_day_heading_context() {
        let html = r#"
        <html><body>
            <h2>Monday</h2>
            <p>6:00 PM Yoga Flow</p>
            <p>7:30 PM Mobility</p>
        </body></html>
        "#;
        let result = extract(html, "https://x.example/");
        assert_eq!(result.classes.len(), 2);
        assert_eq!(result.classes[0].start_raw, "Monday 6:00 PM");
        assert_eq!(result.classes[1].start_raw, "Monday 7:30 PM");
    }

    #[test]
    fn test_spa_shell_yields_nothing() {
        let html = r#"<html><body><div id="root"></div></body></html>"#;
        let result = extract(html, "https://x.example/");
        assert!(result.classes.is_empty());
    }

    #[test]
    fn test_site_name_falls_back_to_host() {
        let html = "<html><body><p>Monday 6:00 PM Yoga</p></body></html>";
        let result = extract(html, "https://gym.example/schedule");
        assert_eq!(result.organization.unwrap().name, "gym.example");
    }

    #[test]
    fn test_og_site_name_preferred() {
        let html = r#"
        <html><head>
            <meta property="og:site_name" content="Sunrise Strength Co." />
            <title>Schedule - Sunrise</title>
        </head><body><p>Monday 6:00 PM Yoga</p></body></html>
        "#;
        let result = extract(html, "https://x.example/");
        assert_eq!(result.organization.unwrap().name, "Sunrise Strength Co.");
    }

    #[test]
    fn test_selector_extraction() {
        let html = r#"
        <html><body>
            <div class="bw-session">
                <div class="bw-session__name">CrossFit WOD</div>
                <div class="bw-session__time">Mon 6:00 AM - 7:00 AM</div>
                <div class="bw-session__staff">Jordan</div>
            </div>
        </body></html>
        "#;
        let result = extract_with_selectors(
            html,
            "https://x.example/",
            ".bw-session",
            ".bw-session__name",
            ".bw-session__time",
            ".bw-session__staff",
        );
        assert_eq!(result.classes.len(), 1);
        assert_eq!(result.classes[0].name, "CrossFit WOD");
        assert_eq!(result.classes[0].start_raw, "Mon 6:00 AM");
        assert_eq!(result.classes[0].end_raw.as_deref(), Some("7:00 AM"));
        assert_eq!(result.classes[0].instructor.as_deref(), Some("Jordan"));
    }

    #[test]
    fn test_punctuation_in_names_preserved() {
        let html = "<html><body><p>Sunday 8:00 AM Mom & Me (Beginner!)</p></body></html>";
        let result = extract(html, "https://x.example/");
        assert_eq!(result.classes[0].name, "Mom & Me (Beginner!)");
    }
}
