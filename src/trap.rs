//! Crawler-trap and loop detection.
//!
//! Traps are URLs or pages built to waste crawler resources: calendar loops,
//! session-id mazes, infinite facet grids. Detection is structural on the
//! URL (repeating segments, parameter floods, high-entropy segments, depth)
//! and content-based on the page (duplicate content hashes, token density).
//!
//! Per-host state is monotonic within a session; `reset` is explicit.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use url::Url;

/// Verdict from a trap check.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapVerdict {
    pub safe: bool,
    pub reason: Option<String>,
}

impl TrapVerdict {
    fn safe() -> Self {
        Self { safe: true, reason: None }
    }

    fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Default)]
struct HostState {
    visited: HashSet<String>,
    /// 16-hex prefixes of SHA-256 content hashes.
    content_hashes: HashSet<String>,
    depth: u32,
}

/// Trap detector with per-host visited/hash/depth state.
pub struct TrapDetector {
    hosts: Mutex<HashMap<String, HostState>>,
    max_depth: u32,
}

/// Token count above which low density plus zero classes means a trap.
/// Anything under 100 tokens is always density-safe, which this threshold
/// subsumes.
const DENSITY_CHECK_TOKENS: usize = 500;
const MIN_SCHEDULE_DENSITY: f64 = 0.005;
const MAX_QUERY_PARAMS: usize = 8;
const MAX_SEGMENT_REPEATS: usize = 3;
const ENTROPY_SEGMENT_LEN: usize = 20;
const MAX_SEGMENT_ENTROPY: f64 = 4.0;

/// Small fixed vocabulary of schedule-ish words, beyond day names and
/// time-like tokens, used for content density scoring.
const GYM_VOCAB: &[&str] = &[
    "class", "classes", "schedule", "gym", "fitness", "workout", "training",
    "trainer", "instructor", "coach", "yoga", "pilates", "spin", "cycle",
    "hiit", "crossfit", "wod", "barre", "zumba", "bootcamp", "strength",
    "cardio", "session", "am", "pm", "open", "reserve", "book",
];

const DAY_NAMES: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday",
    "sunday", "mon", "tue", "wed", "thu", "fri", "sat", "sun",
];

impl TrapDetector {
    pub fn new(max_depth: u32) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            max_depth,
        }
    }

    /// Structural pre-fetch check. Invalid URLs fail closed.
    pub fn check_url(&self, raw_url: &str) -> TrapVerdict {
        let url = match Url::parse(raw_url) {
            Ok(u) => u,
            Err(_) => return TrapVerdict::unsafe_because("unparseable URL"),
        };
        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return TrapVerdict::unsafe_because("URL has no host"),
        };

        let hosts = self.hosts.lock().expect("trap state lock");
        if let Some(state) = hosts.get(&host) {
            if state.depth >= self.max_depth {
                return TrapVerdict::unsafe_because(format!(
                    "crawl depth {} reached for {host}",
                    self.max_depth
                ));
            }
            if state.visited.contains(url.as_str()) {
                return TrapVerdict::unsafe_because("URL already visited");
            }
        }
        drop(hosts);

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for seg in &segments {
            let n = counts.entry(*seg).or_insert(0);
            *n += 1;
            if *n >= MAX_SEGMENT_REPEATS {
                return TrapVerdict::unsafe_because(format!("path segment {seg:?} repeats"));
            }
        }

        if url.query_pairs().count() > MAX_QUERY_PARAMS {
            return TrapVerdict::unsafe_because("too many query parameters");
        }

        for seg in &segments {
            if seg.len() > ENTROPY_SEGMENT_LEN && shannon_entropy(seg) > MAX_SEGMENT_ENTROPY {
                return TrapVerdict::unsafe_because(format!(
                    "high-entropy path segment {seg:?}"
                ));
            }
        }

        TrapVerdict::safe()
    }

    /// Post-fetch content check. On pass, records the content hash, marks the
    /// URL visited, and increments host depth.
    pub fn check_content(&self, raw_url: &str, text: &str, class_count: usize) -> TrapVerdict {
        // The visited set is keyed on the canonical form so a later
        // `check_url` (which compares canonically) cannot miss this entry.
        let url = match Url::parse(raw_url) {
            Ok(u) => u,
            Err(_) => return TrapVerdict::unsafe_because("unparseable URL"),
        };
        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return TrapVerdict::unsafe_because("URL has no host"),
        };

        let hash_prefix = content_hash_prefix(text);

        let mut hosts = self.hosts.lock().expect("trap state lock");
        let state = hosts.entry(host).or_default();

        if state.content_hashes.contains(&hash_prefix) {
            return TrapVerdict::unsafe_because("duplicate content hash");
        }

        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() > DENSITY_CHECK_TOKENS && class_count == 0 {
            let density = schedule_token_density(&tokens);
            if density < MIN_SCHEDULE_DENSITY {
                return TrapVerdict::unsafe_because(format!(
                    "schedule token density {density:.4} with no classes"
                ));
            }
        }

        state.content_hashes.insert(hash_prefix);
        state.visited.insert(url.as_str().to_string());
        state.depth += 1;
        TrapVerdict::safe()
    }

    /// Drop all per-host state.
    pub fn reset(&self) {
        self.hosts.lock().expect("trap state lock").clear();
    }

    /// Current depth counter for a host, for diagnostics.
    pub fn depth(&self, host: &str) -> u32 {
        self.hosts
            .lock()
            .expect("trap state lock")
            .get(host)
            .map_or(0, |s| s.depth)
    }
}

/// First 16 hex chars of the SHA-256 of the content.
fn content_hash_prefix(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }
    let len = s.chars().count() as f64;
    if len == 0.0 {
        return 0.0;
    }
    freq.values()
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Fraction of tokens that look schedule-related: day names, time-like
/// tokens, or the fixed gym vocabulary.
fn schedule_token_density(tokens: &[&str]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens
        .iter()
        .filter(|t| {
            let lower: String = t
                .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != ':')
                .to_lowercase();
            DAY_NAMES.contains(&lower.as_str())
                || GYM_VOCAB.contains(&lower.as_str())
                || is_time_like(&lower)
        })
        .count();
    hits as f64 / tokens.len() as f64
}

/// `6:00`, `18:30`, `6pm`, `6:00pm` shapes.
fn is_time_like(token: &str) -> bool {
    let t = token.trim_end_matches("am").trim_end_matches("pm");
    if t.is_empty() {
        return false;
    }
    if let Some((h, m)) = t.split_once(':') {
        return h.len() <= 2
            && h.chars().all(|c| c.is_ascii_digit())
            && m.len() == 2
            && m.chars().all(|c| c.is_ascii_digit());
    }
    // bare hour only counts when a meridiem suffix was present
    token.len() != t.len() && t.len() <= 2 && t.chars().all(|c| c.is_ascii_digit())
}
