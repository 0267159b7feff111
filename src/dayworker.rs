//! Day-worker pool: discover date-parameterised API patterns from observed
//! page traffic, then replay them for a whole week in parallel.
//!
//! Discovery never guesses endpoints — it only templates requests the page
//! itself made, with the date swapped for a `{{date}}` placeholder. Replays
//! go through the API rate limiter; days complete in no particular order
//! and partial success is acceptable.

use crate::compliance::ratelimit::RateLimiter;
use crate::types::{DateFormat, DayApiPattern, DayFetchResult, HttpMethod};
use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// One request observed by the page instrumentation.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub url: String,
    pub method: String,
    /// Lower-cased header pairs.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Placeholder for a string-typed date.
const DATE_SLOT: &str = "{{date}}";
/// Placeholder for a numeric epoch date; substitution drops the quotes.
const DATE_SLOT_NUM: &str = "{{date:num}}";

/// Headers never copied into a replay template.
const EXCLUDED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "cookie",
];

// ── Discovery ────────────────────────────────────────────────────────────────

/// Scan captured requests for date-carrying URLs or JSON bodies and build
/// replay templates. Patterns that cannot be substituted back into a
/// well-formed request are discarded.
pub fn discover_patterns(requests: &[CapturedRequest]) -> Vec<DayApiPattern> {
    let mut patterns: Vec<DayApiPattern> = Vec::new();

    for req in requests {
        let method = match req.method.to_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            _ => continue,
        };

        let url_hit = template_url(&req.url);
        let body_hit = req.body.as_deref().and_then(template_body);

        let (url_template, date_param, url_format) = match url_hit {
            Some((template, param, format)) => (template, param, Some(format)),
            None => (req.url.clone(), None, None),
        };
        let (body_template, body_paths, body_format) = match body_hit {
            Some((template, paths, format)) => (Some(template), paths, Some(format)),
            None => (None, Vec::new(), None),
        };

        let Some(date_format) = url_format.or(body_format) else {
            continue;
        };

        let pattern = DayApiPattern {
            url_template,
            method,
            date_param,
            body_template,
            body_date_paths: body_paths,
            headers: filter_headers(&req.headers),
            date_format,
        };

        if !is_replayable(&pattern) {
            debug!(url = %req.url, "discarding non-substitutable day pattern");
            continue;
        }
        if patterns
            .iter()
            .any(|p| p.url_template == pattern.url_template && p.body_template == pattern.body_template)
        {
            continue;
        }
        patterns.push(pattern);
    }

    patterns
}

/// Find a date in the URL's query values or path segments and template it.
/// Returns `(template, query_param_name, format)`.
fn template_url(raw: &str) -> Option<(String, Option<String>, DateFormat)> {
    let url = Url::parse(raw).ok()?;

    if let Some(query) = url.query() {
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if let Some(format) = classify_date(value) {
                let template = raw.replacen(pair, &format!("{key}={DATE_SLOT}"), 1);
                return Some((template, Some(key.to_string()), format));
            }
        }
    }

    if let Some(segments) = url.path_segments() {
        for segment in segments {
            if let Some(format) = classify_date(segment) {
                let template = raw.replacen(&format!("/{segment}"), &format!("/{DATE_SLOT}"), 1);
                return Some((template, None, format));
            }
        }
    }

    None
}

/// Find date-valued fields in a JSON body, record their dotted paths, and
/// emit a template with placeholders in place.
fn template_body(body: &str) -> Option<(String, Vec<String>, DateFormat)> {
    let mut value: Value = serde_json::from_str(body).ok()?;
    let mut paths = Vec::new();
    let mut format = None;
    walk_body(&mut value, String::new(), &mut paths, &mut format);
    let format = format?;
    Some((value.to_string(), paths, format))
}

fn walk_body(value: &mut Value, path: String, paths: &mut Vec<String>, format: &mut Option<DateFormat>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk_body(child, child_path, paths, format);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter_mut().enumerate() {
                walk_body(child, format!("{path}[{idx}]"), paths, format);
            }
        }
        Value::String(s) => {
            if let Some(fmt) = classify_date(s) {
                format.get_or_insert(fmt);
                paths.push(path);
                *s = DATE_SLOT.to_string();
            }
        }
        Value::Number(n) => {
            if let Some(fmt) = n.as_u64().and_then(|u| classify_date(&u.to_string())) {
                format.get_or_insert(fmt);
                paths.push(path);
                *value = Value::String(DATE_SLOT_NUM.to_string());
            }
        }
        _ => {}
    }
}

/// Full-string date classification.
fn classify_date(s: &str) -> Option<DateFormat> {
    let bytes = s.as_bytes();

    // ISO YYYY-MM-DD
    if bytes.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-' {
        if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
            return Some(DateFormat::Iso);
        }
    }
    // US MM/DD/YYYY
    if bytes.len() == 10 && bytes[2] == b'/' && bytes[5] == b'/' {
        if NaiveDate::parse_from_str(s, "%m/%d/%Y").is_ok() {
            return Some(DateFormat::UsSlash);
        }
    }
    // Epoch: 10-13 digits
    if (10..=13).contains(&s.len()) && s.chars().all(|c| c.is_ascii_digit()) {
        return Some(if s.len() >= 12 {
            DateFormat::EpochMillis
        } else {
            DateFormat::EpochSeconds
        });
    }

    None
}

fn filter_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| {
            let k = k.to_lowercase();
            !EXCLUDED_HEADERS.contains(&k.as_str()) && !k.starts_with("sec-fetch-")
        })
        .cloned()
        .collect()
}

// ── Substitution ─────────────────────────────────────────────────────────────

/// Render the pattern for one date. Returns `(url, body)`.
pub fn substitute(pattern: &DayApiPattern, date: NaiveDate) -> Option<(String, Option<String>)> {
    let date_text = format_date(pattern.date_format, date);

    let url = pattern.url_template.replace(DATE_SLOT, &date_text);
    Url::parse(&url).ok()?;

    let body = match &pattern.body_template {
        Some(template) => {
            // Numeric slots drop their quotes so the JSON type survives.
            let rendered = template
                .replace(&format!("\"{DATE_SLOT_NUM}\""), &date_text)
                .replace(DATE_SLOT, &date_text);
            serde_json::from_str::<Value>(&rendered).ok()?;
            Some(rendered)
        }
        None => None,
    };

    Some((url, body))
}

/// Invariant: a pattern must substitute into a well-formed request.
fn is_replayable(pattern: &DayApiPattern) -> bool {
    let probe = NaiveDate::from_ymd_opt(2026, 2, 9).expect("probe date is valid");
    substitute(pattern, probe).is_some()
}

fn format_date(format: DateFormat, date: NaiveDate) -> String {
    match format {
        DateFormat::Iso => date.format("%Y-%m-%d").to_string(),
        DateFormat::UsSlash => date.format("%m/%d/%Y").to_string(),
        DateFormat::EpochSeconds => date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp()
            .to_string(),
        DateFormat::EpochMillis => (date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp()
            * 1000)
            .to_string(),
    }
}

// ── Parallel replay ──────────────────────────────────────────────────────────

/// Replay a pattern for the 7 days starting at `week_start`, throttled by
/// the API limiter. All 7 are submitted at once; the limiter enforces
/// concurrency and spacing. Results arrive per day; failures do not cancel
/// the rest.
pub async fn fetch_week_parallel(
    pattern: &DayApiPattern,
    week_start: NaiveDate,
    cookie_header: Option<String>,
    limiter: Arc<RateLimiter>,
    timeout_ms: u64,
) -> Vec<DayFetchResult> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .unwrap_or_default();

    let dates: Vec<NaiveDate> = (0..7)
        .map(|offset| week_start + ChronoDuration::days(offset))
        .collect();

    stream::iter(dates)
        .map(|date| {
            let pattern = pattern.clone();
            let client = client.clone();
            let limiter = Arc::clone(&limiter);
            let cookie_header = cookie_header.clone();
            async move { replay_day(&pattern, date, cookie_header, client, limiter).await }
        })
        .buffer_unordered(7)
        .collect()
        .await
}

async fn replay_day(
    pattern: &DayApiPattern,
    date: NaiveDate,
    cookie_header: Option<String>,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
) -> DayFetchResult {
    let iso = date.format("%Y-%m-%d").to_string();

    let Some((url, body)) = substitute(pattern, date) else {
        return DayFetchResult {
            date: iso,
            status: 0,
            success: false,
            body: None,
            error: Some("pattern substitution failed".into()),
        };
    };

    let _permit = limiter.acquire().await;

    let mut request = match pattern.method {
        HttpMethod::Get => client.get(&url),
        HttpMethod::Post => client.post(&url),
    };
    for (name, value) in &pattern.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(cookie) = &cookie_header {
        request = request.header("cookie", cookie.as_str());
    }
    if let Some(body) = body {
        if !pattern.headers.iter().any(|(k, _)| k == "content-type") {
            request = request.header("content-type", "application/json");
        }
        request = request.body(body);
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let success = (200..300).contains(&status);
            let body = resp.text().await.ok();
            DayFetchResult {
                date: iso,
                status,
                success,
                body,
                error: None,
            }
        }
        Err(err) => DayFetchResult {
            date: iso,
            status: 0,
            success: false,
            body: None,
            error: Some(err.to_string()),
        },
    }
}
