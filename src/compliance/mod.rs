//! Compliance gate: robots policy, per-host rate limiting, wall detection.
//!
//! Every page fetch passes the page limiter for its host; day-worker replays
//! pass the API limiter. Both limiter families are materialized lazily on
//! first use and retained until an explicit reset.

pub mod ratelimit;
pub mod robots;

use self::ratelimit::{LimiterPolicy, RateLimiter};
use self::robots::RobotsCache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

/// Paywall answers carry 402.
pub fn is_paywall(status: u16) -> bool {
    status == 402
}

/// Auth walls answer 401 or 403.
pub fn is_auth_wall(status: u16) -> bool {
    status == 401 || status == 403
}

/// Process-wide compliance state: robots cache plus the two limiter maps.
pub struct Compliance {
    robots: RobotsCache,
    rate_limit_ms: u64,
    page_limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
    api_limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl Compliance {
    pub fn new(bot_user_agent: &str, rate_limit_ms: u64) -> Self {
        Self {
            robots: RobotsCache::new(bot_user_agent),
            rate_limit_ms,
            page_limiters: Mutex::new(HashMap::new()),
            api_limiters: Mutex::new(HashMap::new()),
        }
    }

    /// robots.txt verdict for this URL (fetched once per host, fail-open).
    pub async fn is_allowed(&self, url: &str) -> bool {
        self.robots.is_allowed(url).await
    }

    /// The page-level limiter for this URL's host.
    pub fn page_limiter_for(&self, url: &str) -> Arc<RateLimiter> {
        let host = host_of(url);
        let mut map = self.page_limiters.lock().expect("limiter map lock");
        Arc::clone(
            map.entry(host)
                .or_insert_with(|| Arc::new(RateLimiter::new(LimiterPolicy::page(self.rate_limit_ms)))),
        )
    }

    /// The day-worker API limiter for this URL's host.
    pub fn api_limiter_for(&self, url: &str) -> Arc<RateLimiter> {
        let host = host_of(url);
        let mut map = self.api_limiters.lock().expect("limiter map lock");
        Arc::clone(
            map.entry(host)
                .or_insert_with(|| Arc::new(RateLimiter::new(LimiterPolicy::api()))),
        )
    }

    /// Drop limiters and cached robots policies.
    pub async fn reset(&self) {
        self.page_limiters.lock().expect("limiter map lock").clear();
        self.api_limiters.lock().expect("limiter map lock").clear();
        self.robots.reset().await;
    }
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}
