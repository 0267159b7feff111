//! Session state, the authentication gate, and re-login orchestration.
//!
//! The gate is an awaitable latch every fetch parks on. A logout signal from
//! any page's response monitor closes it; one re-authentication task (guarded
//! by a one-shot flag, so re-entrant closures are suppressed) runs the login
//! flow and then either opens the gate for every parked caller at once or
//! fails them all together.

pub mod cookies;
pub mod login;
pub mod totp;

use crate::browser::{BrowserPool, PageLease};
use crate::compliance;
use crate::config::Config;
use crate::error::ScanError;
use crate::planner::PagePlanner;
use crate::types::SessionState;
use self::cookies::CookieStore;
use regex::Regex;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::watch;
use tracing::{info, warn};

/// Maximum login attempts per gate epoch.
const MAX_LOGIN_ATTEMPTS: u32 = 2;

/// Gate positions. `Failed` is terminal for the current epoch; a later
/// logout signal starts a fresh epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Open,
    Closed,
    Failed,
}

fn login_redirect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/(login|signin|auth|sso)").expect("login redirect regex is valid")
    })
}

/// Process-wide session coordinator.
pub struct SessionManager {
    config: Arc<Config>,
    state: StdMutex<SessionState>,
    gate: watch::Sender<GateStatus>,
    login_in_progress: StdMutex<bool>,
    cookie_store: CookieStore,
    planner: Option<Arc<dyn PagePlanner>>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, planner: Option<Arc<dyn PagePlanner>>) -> Self {
        let (gate, _) = watch::channel(GateStatus::Open);
        let cookie_store = CookieStore::new(&config.cookie_store_path, config.cookie_ttl_hours);
        Self {
            config,
            state: StdMutex::new(SessionState::Unknown),
            gate,
            login_in_progress: StdMutex::new(false),
            cookie_store,
            planner,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock") = state;
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn planner(&self) -> Option<&Arc<dyn PagePlanner>> {
        self.planner.as_ref()
    }

    /// Park until the gate opens. Fails when the current epoch's
    /// re-authentication has been exhausted.
    pub async fn wait_for_gate(&self) -> Result<(), ScanError> {
        let mut rx = self.gate.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                GateStatus::Open => return Ok(()),
                GateStatus::Failed => {
                    return Err(ScanError::LoginFailed {
                        attempts: MAX_LOGIN_ATTEMPTS,
                        reason: "re-authentication exhausted".into(),
                    })
                }
                GateStatus::Closed => {
                    if rx.changed().await.is_err() {
                        return Err(ScanError::transport("session gate dropped"));
                    }
                }
            }
        }
    }

    pub fn gate_status(&self) -> GateStatus {
        *self.gate.borrow()
    }

    /// Logout-signal sink for page response monitors: 401/403, or a redirect
    /// whose Location points at a login route.
    pub fn note_response(&self, status: u16, location: Option<&str>) {
        if compliance::is_auth_wall(status) {
            self.close_gate(format!("status {status}"));
            return;
        }
        if (300..400).contains(&status) {
            if let Some(loc) = location {
                if login_redirect_re().is_match(loc) {
                    self.close_gate(format!("redirect to {loc}"));
                }
            }
        }
    }

    /// Close the gate and mark the session logged out. A close while the
    /// gate is already closed is suppressed so the running login flow's own
    /// traffic cannot re-trigger it.
    pub fn close_gate(&self, reason: impl AsRef<str>) {
        if *self.gate.borrow() == GateStatus::Closed {
            return;
        }
        warn!(reason = reason.as_ref(), "session gate closed");
        self.set_state(SessionState::LoggedOut);
        let _ = self.gate.send(GateStatus::Closed);
    }

    /// Post-navigation probe: a visible password input means a login wall.
    /// Closes the gate when found.
    pub async fn check_for_login_wall(&self, lease: &PageLease) -> bool {
        let probe = r#"(() => {
            const el = document.querySelector('input[type="password"]');
            return !!el && el.offsetParent !== null;
        })()"#;
        let walled = match lease.page().evaluate(probe).await {
            Ok(result) => result.into_value::<bool>().unwrap_or(false),
            Err(_) => false,
        };
        if walled {
            self.close_gate("visible password input after navigation");
        }
        walled
    }

    /// Load persisted cookies into a fresh page when the store is fresh.
    pub async fn preload_cookies(&self, lease: &PageLease) {
        if let Some(cookies) = self.cookie_store.load_fresh() {
            if lease.set_cookies_json(&cookies).await.is_ok() {
                self.set_state(SessionState::LoggedIn);
            }
        }
    }

    /// Current cookies rendered as a `Cookie:` header for API replays.
    pub fn cookie_header(&self) -> Option<String> {
        self.cookie_store
            .load_fresh()
            .map(|cookies| CookieStore::header_value(&cookies))
            .filter(|h| !h.is_empty())
    }

    /// Write the page's cookies back to the store.
    pub async fn persist_cookies(&self, lease: &PageLease) -> anyhow::Result<()> {
        let cookies = lease.cookies_json().await?;
        self.cookie_store.save(cookies)?;
        Ok(())
    }

    /// Force a new gate epoch and run re-authentication.
    pub async fn reauthenticate(&self, pool: &BrowserPool, url: &str) -> Result<(), ScanError> {
        self.close_gate("re-authentication requested");
        self.ensure_authenticated(pool, url).await
    }

    /// Resolve a closed gate: exactly one caller runs the login flow, every
    /// other caller parks; all are released or failed together.
    pub async fn ensure_authenticated(
        &self,
        pool: &BrowserPool,
        url: &str,
    ) -> Result<(), ScanError> {
        if self.gate_status() == GateStatus::Open {
            return Ok(());
        }

        let elected = {
            let mut flag = self.login_in_progress.lock().expect("login flag lock");
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        };
        if !elected {
            return self.wait_for_gate().await;
        }

        let outcome = self.run_login_attempts(pool, url).await;
        *self.login_in_progress.lock().expect("login flag lock") = false;

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::LoggedIn);
                let _ = self.gate.send(GateStatus::Open);
                info!("re-authentication succeeded, gate open");
                Ok(())
            }
            Err(reason) => {
                let _ = self.gate.send(GateStatus::Failed);
                warn!(%reason, "re-authentication exhausted, gate failed");
                Err(ScanError::LoginFailed {
                    attempts: MAX_LOGIN_ATTEMPTS,
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn run_login_attempts(&self, pool: &BrowserPool, url: &str) -> anyhow::Result<()> {
        if !self.config.has_credentials() {
            anyhow::bail!("no login credentials configured");
        }

        let mut last_err = anyhow::anyhow!("login never attempted");
        for attempt in 1..=MAX_LOGIN_ATTEMPTS {
            info!(attempt, "login attempt");
            match login::run_login(self, pool, url).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, %err, "login attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(Config::new("https://db", "key")), None)
    }

    #[test]
    fn test_gate_starts_open() {
        let mgr = manager();
        assert_eq!(mgr.gate_status(), GateStatus::Open);
        assert_eq!(mgr.state(), SessionState::Unknown);
    }

    #[test]
    fn test_auth_status_closes_gate() {
        let mgr = manager();
        mgr.note_response(401, None);
        assert_eq!(mgr.gate_status(), GateStatus::Closed);
        assert_eq!(mgr.state(), SessionState::LoggedOut);
    }

    #[test]
    fn test_login_redirect_closes_gate() {
        let mgr = manager();
        mgr.note_response(302, Some("https://gym.example/login?next=%2Fschedule"));
        assert_eq!(mgr.gate_status(), GateStatus::Closed);
    }

    #[test]
    fn test_plain_redirect_keeps_gate_open() {
        let mgr = manager();
        mgr.note_response(301, Some("https://gym.example/new-home"));
        assert_eq!(mgr.gate_status(), GateStatus::Open);
        mgr.note_response(200, None);
        assert_eq!(mgr.gate_status(), GateStatus::Open);
    }

    #[test]
    fn test_reentrant_close_suppressed() {
        let mgr = manager();
        mgr.close_gate("first");
        // Re-entrant closure during a login must not panic or re-signal.
        mgr.close_gate("second");
        assert_eq!(mgr.gate_status(), GateStatus::Closed);
    }

    #[tokio::test]
    async fn test_wait_on_open_gate_returns_immediately() {
        let mgr = manager();
        mgr.wait_for_gate().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiters_released_together_on_open() {
        let mgr = Arc::new(manager());
        mgr.close_gate("test");

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let mgr = Arc::clone(&mgr);
            waiters.push(tokio::spawn(async move { mgr.wait_for_gate().await }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = mgr.gate.send(GateStatus::Open);

        for w in waiters {
            assert!(w.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_waiters_failed_together_on_exhaustion() {
        let mgr = Arc::new(manager());
        mgr.close_gate("test");

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let mgr = Arc::clone(&mgr);
            waiters.push(tokio::spawn(async move { mgr.wait_for_gate().await }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = mgr.gate.send(GateStatus::Failed);

        for w in waiters {
            let result = w.await.unwrap();
            assert!(matches!(result, Err(ScanError::LoginFailed { .. })));
        }
    }
}
