//! Process configuration, read once from the environment and frozen.
//!
//! Only `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY` are required; every
//! other key falls back to a documented default. Malformed numeric values
//! fall back silently rather than aborting the run.

use crate::error::ScanError;
use std::path::PathBuf;

/// Default transparent user agent for robots.txt lookups.
pub const DEFAULT_BOT_USER_AGENT: &str = "MilesC-GymBot/1.0 (+url)";

/// Frozen process configuration. Constructed once, shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upsert sink endpoint (PostgREST base URL).
    pub supabase_url: String,
    /// Upsert sink credential (service role key).
    pub supabase_key: String,
    /// Transparent UA used for robots lookups.
    pub bot_user_agent: String,
    /// Page-limiter minimum interval in milliseconds.
    pub rate_limit_ms: u64,
    /// Enables the LLM planner when present.
    pub openai_api_key: Option<String>,
    /// Cumulative planner spend cap in cents.
    pub llm_budget_cents: u32,
    /// Login credentials for gated schedules.
    pub gym_username: Option<String>,
    pub gym_password: Option<String>,
    /// Base32 TOTP seed for 2FA challenges.
    pub gym_totp_secret: Option<String>,
    /// Persisted-cookie freshness window in hours.
    pub cookie_ttl_hours: u64,
    /// Trap detector depth threshold.
    pub max_crawl_depth: u32,
    /// Light-path request timeout in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Cookie store location.
    pub cookie_store_path: PathBuf,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Fails with `ConfigMissing` when a required key is absent.
    pub fn from_env() -> Result<Self, ScanError> {
        let supabase_url =
            std::env::var("SUPABASE_URL").map_err(|_| ScanError::ConfigMissing("SUPABASE_URL"))?;
        let supabase_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| ScanError::ConfigMissing("SUPABASE_SERVICE_ROLE_KEY"))?;

        Ok(Self {
            supabase_url,
            supabase_key,
            bot_user_agent: env_or("BOT_USER_AGENT", DEFAULT_BOT_USER_AGENT),
            rate_limit_ms: env_parsed("RATE_LIMIT_MS", 2000),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            llm_budget_cents: env_parsed("LLM_BUDGET_CENTS", 50),
            gym_username: std::env::var("GYM_USERNAME").ok().filter(|v| !v.is_empty()),
            gym_password: std::env::var("GYM_PASSWORD").ok().filter(|v| !v.is_empty()),
            gym_totp_secret: std::env::var("GYM_TOTP_SECRET").ok().filter(|v| !v.is_empty()),
            cookie_ttl_hours: env_parsed("COOKIE_TTL_HOURS", 24),
            max_crawl_depth: env_parsed("MAX_CRAWL_DEPTH", 5),
            fetch_timeout_ms: env_parsed("FETCH_TIMEOUT_MS", 30_000),
            cookie_store_path: PathBuf::from(".cookies.json"),
        })
    }

    /// Build a config with explicit sink settings and all defaults otherwise.
    pub fn new(supabase_url: impl Into<String>, supabase_key: impl Into<String>) -> Self {
        Self {
            supabase_url: supabase_url.into(),
            supabase_key: supabase_key.into(),
            bot_user_agent: DEFAULT_BOT_USER_AGENT.to_string(),
            rate_limit_ms: 2000,
            openai_api_key: None,
            llm_budget_cents: 50,
            gym_username: None,
            gym_password: None,
            gym_totp_secret: None,
            cookie_ttl_hours: 24,
            max_crawl_depth: 5,
            fetch_timeout_ms: 30_000,
            cookie_store_path: PathBuf::from(".cookies.json"),
        }
    }

    /// True when login credentials are configured.
    pub fn has_credentials(&self) -> bool {
        self.gym_username.is_some() && self.gym_password.is_some()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
