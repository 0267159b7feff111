//! Browser acquisition path.
//!
//! Borrows an instrumented page, navigates with network-idle semantics,
//! runs the login-wall probe, optionally settles longer, performs the idle
//! behavior, and captures HTML. The returned result carries the live lease;
//! the caller disposes it after downstream validation.

use super::FetchResult;
use crate::browser::BrowserPool;
use crate::error::ScanError;
use crate::session::SessionManager;
use crate::types::FetchMethod;
use std::time::Duration;

pub async fn fetch_with_browser(
    pool: &BrowserPool,
    session: &SessionManager,
    url: &str,
    extra_settle: Option<Duration>,
) -> Result<FetchResult, ScanError> {
    let lease = pool
        .borrow_page()
        .await
        .map_err(|e| ScanError::transport(format!("browser borrow: {e:#}")))?;

    let status = match lease.navigate(url).await {
        Ok(status) => status,
        Err(e) => {
            lease.dispose().await;
            return Err(ScanError::transport(format!("browser navigation: {e:#}")));
        }
    };

    // Post-load probe: a visible password input closes the gate. The fetch
    // still returns; the validator's re-authenticate hint drives recovery.
    let _ = session.check_for_login_wall(&lease).await;

    if let Some(extra) = extra_settle {
        lease.settle(extra).await;
    }

    let body = match lease.capture_html().await {
        Ok(html) => html,
        Err(e) => {
            lease.dispose().await;
            return Err(ScanError::transport(format!("html capture: {e:#}")));
        }
    };

    Ok(FetchResult {
        body,
        status,
        method: FetchMethod::Browser,
        lease: Some(lease),
    })
}
