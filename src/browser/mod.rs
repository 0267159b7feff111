//! Managed browser pool over chromiumoxide.
//!
//! One Chromium engine per process, launched lazily behind an async lock so
//! concurrent borrowers serialize startup. Every borrowed page comes
//! instrumented: viewport and headers applied, fingerprint shims installed,
//! request capture and the session login monitor attached, and persisted
//! cookies preloaded. `with_page` is the guaranteed-release form; the
//! explicit `borrow_page`/`dispose` pair exists because the validator needs
//! live DOM access between extraction and disposal.

use crate::dayworker::CapturedRequest;
use crate::session::SessionManager;
use anyhow::{bail, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, Headers, ResourceType,
    SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Network-idle threshold: at most this many requests in flight.
const IDLE_MAX_IN_FLIGHT: i64 = 2;
/// Sustained quiet time that counts as idle.
const IDLE_WINDOW: Duration = Duration::from_millis(500);
/// Hard cap on navigation plus idle settling.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Late-render grace after idle.
const LATE_RENDER_WAIT: Duration = Duration::from_secs(1);

/// Script installed before any site JS runs: hide the automation flags a
/// headless Chromium leaks.
const FINGERPRINT_SHIM: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Find the Chromium binary.
fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("GYMSCAN_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/opt/google/chrome/chrome",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ];
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

struct Engine {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl Engine {
    async fn launch() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found. Set GYMSCAN_CHROMIUM_PATH or install Chrome.")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--window-size=1366,768")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self { browser, handler })
    }
}

/// Process-wide browser pool.
pub struct BrowserPool {
    session: Arc<SessionManager>,
    engine: tokio::sync::Mutex<Option<Engine>>,
}

impl BrowserPool {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            engine: tokio::sync::Mutex::new(None),
        }
    }

    /// Borrow an instrumented page. The caller owns disposal.
    pub async fn borrow_page(&self) -> Result<PageLease> {
        let page = {
            let mut guard = self.engine.lock().await;
            if guard.is_none() {
                *guard = Some(Engine::launch().await?);
            }
            let engine = guard.as_ref().expect("engine just ensured");
            engine
                .browser
                .new_page("about:blank")
                .await
                .context("failed to create page")?
        };

        page.execute(EnableParams::default())
            .await
            .context("failed to enable network domain")?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(json!({
            "accept-language": "en-US,en;q=0.9",
        }))))
        .await
        .context("failed to set page headers")?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            FINGERPRINT_SHIM.to_string(),
        ))
        .await
        .context("failed to install fingerprint shim")?;

        let lease = PageLease::attach(page, Arc::clone(&self.session)).await?;
        self.session.preload_cookies(&lease).await;
        Ok(lease)
    }

    /// Borrow, run, and dispose in one scope.
    pub async fn with_page<T>(
        &self,
        f: impl for<'a> FnOnce(&'a PageLease) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let lease = self.borrow_page().await?;
        let result = f(&lease).await;
        lease.dispose().await;
        result
    }

    /// Tear down the engine. Safe to call when it never started.
    pub async fn shutdown(&self) {
        let engine = self.engine.lock().await.take();
        if let Some(mut engine) = engine {
            if let Err(err) = engine.browser.close().await {
                warn!(%err, "browser close failed");
            }
            engine.handler.abort();
        }
    }
}

/// A borrowed, instrumented page.
///
/// Owns the request-capture and monitor tasks; `dispose` aborts them before
/// closing the page so no interception listener outlives the context.
pub struct PageLease {
    page: Page,
    captured: Arc<StdMutex<Vec<CapturedRequest>>>,
    in_flight: Arc<AtomicI64>,
    nav_url: Arc<StdMutex<String>>,
    main_status: Arc<StdMutex<Option<u16>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PageLease {
    async fn attach(page: Page, session: Arc<SessionManager>) -> Result<Self> {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicI64::new(0));
        let nav_url = Arc::new(StdMutex::new(String::new()));
        let main_status = Arc::new(StdMutex::new(None));
        let mut tasks = Vec::new();

        // Request observer: in-flight accounting plus XHR/fetch capture for
        // day-pattern discovery. Watch-only, so nothing needs continuing.
        {
            let mut events = page
                .event_listener::<EventRequestWillBeSent>()
                .await
                .context("request listener")?;
            let captured = Arc::clone(&captured);
            let in_flight = Arc::clone(&in_flight);
            tasks.push(tokio::spawn(async move {
                while let Some(ev) = events.next().await {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let is_api = matches!(
                        ev.r#type,
                        Some(ResourceType::Xhr) | Some(ResourceType::Fetch)
                    );
                    if is_api {
                        let headers = flatten_headers(&ev.request.headers);
                        let mut log = captured.lock().expect("capture lock");
                        log.push(CapturedRequest {
                            url: ev.request.url.clone(),
                            method: ev.request.method.clone(),
                            headers,
                            body: ev.request.post_data.clone(),
                        });
                    }
                }
            }));
        }

        // Response observer: main-document status, logout signals.
        {
            let mut events = page
                .event_listener::<EventResponseReceived>()
                .await
                .context("response listener")?;
            let nav_url = Arc::clone(&nav_url);
            let main_status = Arc::clone(&main_status);
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                while let Some(ev) = events.next().await {
                    let status = ev.response.status as u16;
                    let current = nav_url.lock().expect("nav url lock").clone();
                    if !current.is_empty() && ev.response.url == current {
                        *main_status.lock().expect("status lock") = Some(status);
                    }
                    let location = header_value(&ev.response.headers, "location");
                    session.note_response(status, location.as_deref());
                }
            }));
        }

        // Loading-finished / loading-failed: in-flight accounting.
        {
            let mut events = page
                .event_listener::<EventLoadingFinished>()
                .await
                .context("loading-finished listener")?;
            let in_flight = Arc::clone(&in_flight);
            tasks.push(tokio::spawn(async move {
                while let Some(_ev) = events.next().await {
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                }
            }));
        }
        {
            let mut events = page
                .event_listener::<EventLoadingFailed>()
                .await
                .context("loading-failed listener")?;
            let in_flight = Arc::clone(&in_flight);
            tasks.push(tokio::spawn(async move {
                while let Some(_ev) = events.next().await {
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                }
            }));
        }

        Ok(Self {
            page,
            captured,
            in_flight,
            nav_url,
            main_status,
            tasks,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Navigate and settle: goto, wait for load, then require the network to
    /// stay under the in-flight threshold for a sustained window, then a late
    /// render grace period. Returns the main-document status (200 when the
    /// engine did not surface one).
    pub async fn navigate(&self, url: &str) -> Result<u16> {
        *self.nav_url.lock().expect("nav url lock") = url.to_string();
        *self.main_status.lock().expect("status lock") = None;
        self.in_flight.store(0, Ordering::Relaxed);

        let deadline = Instant::now() + NAVIGATION_TIMEOUT;

        let goto = tokio::time::timeout(NAVIGATION_TIMEOUT, self.page.goto(url)).await;
        match goto {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {}s", NAVIGATION_TIMEOUT.as_secs()),
        }
        let _ = self.page.wait_for_navigation().await;

        self.wait_for_network_idle(deadline).await;
        tokio::time::sleep(LATE_RENDER_WAIT).await;

        Ok(self
            .main_status
            .lock()
            .expect("status lock")
            .unwrap_or(200))
    }

    async fn wait_for_network_idle(&self, deadline: Instant) {
        let mut quiet_since: Option<Instant> = None;
        while Instant::now() < deadline {
            if self.in_flight.load(Ordering::Relaxed) <= IDLE_MAX_IN_FLIGHT {
                match quiet_since {
                    Some(since) if since.elapsed() >= IDLE_WINDOW => return,
                    Some(_) => {}
                    None => quiet_since = Some(Instant::now()),
                }
            } else {
                quiet_since = None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!("network idle deadline reached");
    }

    /// Short human-shaped idle, then capture the full document HTML.
    pub async fn capture_html(&self) -> Result<String> {
        if let Err(err) = crate::stealth::idle_behavior(&self.page).await {
            debug!(%err, "idle behavior failed");
        }
        self.html().await
    }

    /// Current document HTML without any idle behavior.
    pub async fn html(&self) -> Result<String> {
        let result = self
            .page
            .evaluate("document.documentElement.outerHTML")
            .await
            .context("failed to read HTML")?;
        result
            .into_value::<String>()
            .map_err(|e| anyhow::anyhow!("failed to convert HTML result: {e:?}"))
    }

    /// Click a selector with human-shaped motion and wait out the idle
    /// window that follows (load-more widgets fetch on click).
    pub async fn click_and_settle(&self, selector: &str, idle: Duration) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("no element for {selector:?}"))?;
        crate::stealth::click_human(&self.page, &element).await?;
        self.wait_for_network_idle(Instant::now() + idle).await;
        Ok(())
    }

    /// Extra settle time, for wait-longer retries.
    pub async fn settle(&self, extra: Duration) {
        self.wait_for_network_idle(Instant::now() + extra).await;
    }

    /// Requests captured since page creation.
    pub fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("capture lock").clone()
    }

    /// Current browser cookies as raw JSON values.
    pub async fn cookies_json(&self) -> Result<Vec<serde_json::Value>> {
        let cookies = self.page.get_cookies().await.context("get_cookies")?;
        Ok(cookies
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect())
    }

    /// Install cookies from raw JSON values, skipping malformed entries.
    pub async fn set_cookies_json(&self, cookies: &[serde_json::Value]) -> Result<()> {
        let params: Vec<CookieParam> = cookies
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        if params.is_empty() {
            return Ok(());
        }
        self.page.set_cookies(params).await.context("set_cookies")?;
        Ok(())
    }

    /// Abort observer tasks and close the page. Always safe to call once.
    pub async fn dispose(self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(err) = self.page.close().await {
            debug!(%err, "page close failed");
        }
    }
}

/// CDP headers → sorted key/value pairs.
fn flatten_headers(headers: &Headers) -> Vec<(String, String)> {
    let value = serde_json::to_value(headers).unwrap_or_default();
    let mut out: Vec<(String, String)> = value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.to_lowercase(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    out.sort();
    out
}

fn header_value(headers: &Headers, name: &str) -> Option<String> {
    let value = serde_json::to_value(headers).ok()?;
    let map = value.as_object()?;
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_str().map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_headers() {
        let headers = Headers::new(json!({"Accept": "text/html", "X-Token": "abc"}));
        let flat = flatten_headers(&headers);
        assert_eq!(
            flat,
            vec![
                ("accept".to_string(), "text/html".to_string()),
                ("x-token".to_string(), "abc".to_string()),
            ]
        );
    }

    #[test]
    fn test_header_value_case_insensitive() {
        let headers = Headers::new(json!({"Location": "/login?next=%2F"}));
        assert_eq!(
            header_value(&headers, "location").as_deref(),
            Some("/login?next=%2F")
        );
        assert!(header_value(&headers, "retry-after").is_none());
    }

    #[test]
    fn test_find_chromium_env_override_must_exist() {
        std::env::set_var("GYMSCAN_CHROMIUM_PATH", "/definitely/not/here");
        let found = find_chromium();
        if let Some(path) = found {
            assert_ne!(path, PathBuf::from("/definitely/not/here"));
        }
        std::env::remove_var("GYMSCAN_CHROMIUM_PATH");
    }
}
