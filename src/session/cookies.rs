//! Persisted session cookies.
//!
//! A single JSON store of shape `{ "timestamp": epoch-ms, "cookies": [...] }`.
//! Cookies are loaded into fresh browser contexts while the store is younger
//! than the configured TTL, and written back after a successful login. Writes
//! go through a temp file and rename so a crash never leaves a torn store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    /// Write time in epoch milliseconds.
    timestamp: u64,
    /// Browser cookie objects, kept as raw JSON so the CDP shape round-trips.
    cookies: Vec<serde_json::Value>,
}

/// File-backed cookie store.
pub struct CookieStore {
    path: PathBuf,
    ttl: Duration,
}

impl CookieStore {
    pub fn new(path: impl Into<PathBuf>, ttl_hours: u64) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::from_secs(ttl_hours * 3600),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cookies if the store exists and is fresher than the TTL.
    pub fn load_fresh(&self) -> Option<Vec<serde_json::Value>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let store: StoreFile = serde_json::from_str(&raw).ok()?;

        let age_ms = now_epoch_ms().saturating_sub(store.timestamp);
        if Duration::from_millis(age_ms) > self.ttl {
            return None;
        }
        Some(store.cookies)
    }

    /// Persist cookies with the current timestamp, atomically.
    pub fn save(&self, cookies: Vec<serde_json::Value>) -> Result<()> {
        let store = StoreFile {
            timestamp: now_epoch_ms(),
            cookies,
        };
        let body = serde_json::to_string_pretty(&store)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing cookie store {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing cookie store {}", self.path.display()))?;
        Ok(())
    }

    /// Render cookies as a `Cookie:` header value for replayed API requests.
    pub fn header_value(cookies: &[serde_json::Value]) -> String {
        cookies
            .iter()
            .filter_map(|c| {
                let name = c.get("name")?.as_str()?;
                let value = c.get("value")?.as_str()?;
                Some(format!("{name}={value}"))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
