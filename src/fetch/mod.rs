//! Two-path page acquisition with an intelligent fallback rule.
//!
//! Light first, unless the caller forces the browser: a single impersonated
//! HTTPS request is orders of magnitude cheaper than a rendered session. A
//! light 200 is accepted only when the body shows both a time-like token and
//! a day-name token; anything else (SPA shells, blocked responses, transport
//! errors) falls through to the browser. A 402 short-circuits: paywalls are
//! never retried on the other path.
//!
//! Every fetch first passes robots, then the session gate, then the page
//! limiter for its host.

pub mod browser;
pub mod light;

use crate::browser::{BrowserPool, PageLease};
use crate::compliance::{self, Compliance};
use crate::error::ScanError;
use crate::session::SessionManager;
use crate::tokens::{has_day_token, has_time_token};
use crate::types::FetchMethod;
use async_trait::async_trait;
use self::light::LightClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Options controlling one fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub force_browser: bool,
    /// Extra network-idle settling after navigation (wait-longer retries).
    pub extra_settle: Option<Duration>,
}

/// One acquired page.
pub struct FetchResult {
    pub body: String,
    pub status: u16,
    pub method: FetchMethod,
    /// Live page lease when the browser path was used. The caller owns
    /// disposal, after validation has had its look at the live DOM.
    pub lease: Option<PageLease>,
}

impl std::fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResult")
            .field("status", &self.status)
            .field("method", &self.method)
            .field("body_len", &self.body.len())
            .field("live", &self.lease.is_some())
            .finish()
    }
}

/// Page acquisition seam; the orchestrator only sees this trait.
#[async_trait]
pub trait FetchService: Send + Sync {
    async fn fetch(&self, url: &str, opts: &FetchOptions) -> Result<FetchResult, ScanError>;
}

/// Production fetcher: compliance gate, session gate, light path, browser
/// fallback.
pub struct Fetcher {
    light: LightClient,
    pool: Arc<BrowserPool>,
    session: Arc<SessionManager>,
    compliance: Arc<Compliance>,
}

impl Fetcher {
    pub fn new(
        light: LightClient,
        pool: Arc<BrowserPool>,
        session: Arc<SessionManager>,
        compliance: Arc<Compliance>,
    ) -> Self {
        Self {
            light,
            pool,
            session,
            compliance,
        }
    }

    /// A light body is good enough when it names both a time and a day.
    fn light_body_acceptable(body: &str) -> bool {
        has_time_token(body) && has_day_token(body)
    }
}

#[async_trait]
impl FetchService for Fetcher {
    async fn fetch(&self, url: &str, opts: &FetchOptions) -> Result<FetchResult, ScanError> {
        if !self.compliance.is_allowed(url).await {
            return Err(ScanError::RobotsDisallowed(url.to_string()));
        }

        // Park on the session gate; when it is closed this also drives the
        // single re-authentication task.
        self.session.ensure_authenticated(&self.pool, url).await?;

        let limiter = self.compliance.page_limiter_for(url);
        let _permit = limiter.acquire().await;

        if !opts.force_browser {
            match self.light.get(url).await {
                Ok(resp) => {
                    if compliance::is_paywall(resp.status) {
                        // Paywalls are definitive; no browser fallback.
                        return Ok(FetchResult {
                            body: resp.body,
                            status: resp.status,
                            method: FetchMethod::Light,
                            lease: None,
                        });
                    }
                    if compliance::is_auth_wall(resp.status) {
                        self.session
                            .note_response(resp.status, resp.header("location"));
                        self.session.ensure_authenticated(&self.pool, url).await?;
                    } else if resp.status == 200 && Self::light_body_acceptable(&resp.body) {
                        debug!(url, "light path accepted");
                        return Ok(FetchResult {
                            body: resp.body,
                            status: resp.status,
                            method: FetchMethod::Light,
                            lease: None,
                        });
                    }
                    info!(url, status = resp.status, "light body insufficient, using browser");
                }
                Err(err) => {
                    info!(url, %err, "light fetch failed, using browser");
                }
            }
        }

        browser::fetch_with_browser(&self.pool, &self.session, url, opts.extra_settle).await
    }
}
