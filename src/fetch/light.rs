//! Light acquisition path: a single HTTPS request wearing a desktop Chrome
//! identity.
//!
//! Not a browser — no JS, no rendering. The client sends the full header
//! set a current Chrome build would (UA, Accept-Language, the `sec-ch-ua`
//! client-hint family) so that header-fingerprinting CDNs serve the same
//! HTML they would serve a person.
//!
//! Wall statuses (402 paywall, 401/403 auth) are pipeline signals, not
//! failures: they return to the caller immediately and are never retried
//! here. Only transient trouble (5xx, 429, transport errors) draws from a
//! short pause schedule, and a CDN that resets HTTP/2 streams gets one
//! replay over HTTP/1.1 without spending a pause.

use crate::compliance;
use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                         AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/131.0.0.0 Safari/537.36";

/// Pauses between attempts; the schedule length bounds total attempts.
const RETRY_PAUSES: [Duration; 2] = [Duration::from_millis(400), Duration::from_millis(1200)];

/// Cap on a server-supplied Retry-After, so a hostile header cannot stall
/// the scan.
const MAX_SERVER_BACKOFF: Duration = Duration::from_secs(10);

/// Response from a light GET.
#[derive(Debug, Clone)]
pub struct LightResponse {
    /// Original requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    /// Selected response headers.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl LightResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Impersonating HTTP client for the light path.
#[derive(Clone)]
pub struct LightClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback for sites that reject HTTP/2.
    h1_client: reqwest::Client,
}

/// The header set a desktop Chrome sends with a top-level navigation.
fn impersonated_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "accept",
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert("accept-language", HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Chromium\";v=\"131\", \"Google Chrome\";v=\"131\", \"Not_A Brand\";v=\"24\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("none"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert("upgrade-insecure-requests", HeaderValue::from_static("1"));
    headers
}

impl LightClient {
    pub fn new(timeout_ms: u64) -> Self {
        let build = |h1_only: bool| {
            let mut builder = reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .redirect(reqwest::redirect::Policy::limited(5))
                .user_agent(CHROME_UA)
                .default_headers(impersonated_headers());
            if h1_only {
                builder = builder.http1_only();
            }
            builder.build().unwrap_or_default()
        };

        Self {
            client: build(false),
            h1_client: build(true),
        }
    }

    /// GET a page. Walls come straight back; transient failures consume the
    /// pause schedule; an HTTP/2 protocol failure swaps to the HTTP/1.1
    /// client once, free of charge.
    pub async fn get(&self, url: &str) -> Result<LightResponse> {
        let mut client = &self.client;
        let mut pauses = RETRY_PAUSES.iter().copied();

        loop {
            match self.send_once(client, url).await {
                Ok(resp) if is_wall(resp.status) || !retryable_status(resp.status) => {
                    return Ok(resp);
                }
                Ok(resp) => {
                    // 429 or 5xx: pause and go again, or hand back what we
                    // got once the schedule is spent.
                    let Some(pause) = pauses.next() else {
                        return Ok(resp);
                    };
                    tokio::time::sleep(server_backoff(&resp).unwrap_or(pause)).await;
                }
                Err(err) if wants_h1_replay(&err) && !std::ptr::eq(client, &self.h1_client) => {
                    client = &self.h1_client;
                }
                Err(err) => {
                    let Some(pause) = pauses.next() else {
                        return Err(err.into());
                    };
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// One wire exchange, no recovery.
    async fn send_once(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<LightResponse, reqwest::Error> {
        let r = client.get(url).send().await?;
        let status = r.status().as_u16();
        let final_url = r.url().to_string();

        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .filter(|(k, _)| {
                matches!(
                    k.as_str(),
                    "content-type" | "location" | "set-cookie" | "retry-after"
                )
            })
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = r.text().await.unwrap_or_default();

        Ok(LightResponse {
            url: url.to_string(),
            final_url,
            status,
            headers,
            body,
        })
    }
}

/// Paywall and auth-wall answers carry meaning for the pipeline; retrying
/// them only burns the crawl budget.
fn is_wall(status: u16) -> bool {
    compliance::is_paywall(status) || compliance::is_auth_wall(status)
}

fn retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// A numeric Retry-After on a 429, capped.
fn server_backoff(resp: &LightResponse) -> Option<Duration> {
    if resp.status != 429 {
        return None;
    }
    resp.header("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_SERVER_BACKOFF))
}

/// Some gym-site CDNs advertise HTTP/2 and then reset the stream mid-body;
/// those failures are worth one replay over HTTP/1.1. Walk the source chain
/// because reqwest's top-level message rarely names the protocol.
fn wants_h1_replay(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_status() {
        return false;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let msg = e.to_string();
        if msg.contains("h2") || msg.contains("HTTP/2") || msg.contains("frame") {
            return true;
        }
        source = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds() {
        let _ = LightClient::new(30_000);
    }

    #[test]
    fn test_impersonated_header_set() {
        let headers = impersonated_headers();
        assert!(headers.contains_key("sec-ch-ua"));
        assert!(headers.contains_key("sec-ch-ua-platform"));
        assert!(headers.contains_key("accept-language"));
        assert_eq!(
            headers.get("upgrade-insecure-requests").unwrap(),
            &HeaderValue::from_static("1")
        );
    }

    #[test]
    fn test_walls_are_not_retryable() {
        assert!(is_wall(402));
        assert!(is_wall(401));
        assert!(is_wall(403));
        assert!(!retryable_status(402));
        assert!(!retryable_status(403));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(retryable_status(429));
        assert!(retryable_status(500));
        assert!(retryable_status(503));
        assert!(!retryable_status(200));
        assert!(!retryable_status(404));
    }

    fn resp_with(status: u16, headers: Vec<(String, String)>) -> LightResponse {
        LightResponse {
            url: "https://x.example/".into(),
            final_url: "https://x.example/".into(),
            status,
            headers,
            body: String::new(),
        }
    }

    #[test]
    fn test_server_backoff_capped() {
        let resp = resp_with(429, vec![("retry-after".into(), "3".into())]);
        assert_eq!(server_backoff(&resp), Some(Duration::from_secs(3)));

        let resp = resp_with(429, vec![("retry-after".into(), "86400".into())]);
        assert_eq!(server_backoff(&resp), Some(MAX_SERVER_BACKOFF));
    }

    #[test]
    fn test_server_backoff_only_on_429() {
        let resp = resp_with(503, vec![("retry-after".into(), "3".into())]);
        assert_eq!(server_backoff(&resp), None);

        let resp = resp_with(429, vec![("retry-after".into(), "soon".into())]);
        assert_eq!(server_backoff(&resp), None);
    }

    #[test]
    fn test_header_lookup() {
        let resp = resp_with(200, vec![("location".into(), "/login".into())]);
        assert_eq!(resp.header("location"), Some("/login"));
        assert_eq!(resp.header("retry-after"), None);
    }
}
