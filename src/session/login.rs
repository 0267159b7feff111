//! Credential + TOTP login flow against a live login page.
//!
//! Field discovery walks a prioritized list of common selectors and only
//! then asks the planner. Keystrokes go through the human typing cadence.
//! Success is defined structurally: no password input remains after submit.

use super::{totp, SessionManager};
use crate::browser::{BrowserPool, PageLease};
use crate::stealth;
use anyhow::{bail, Context, Result};
use chromiumoxide::element::Element;
use std::time::Duration;
use tracing::debug;

const LOGIN_NAV_TIMEOUT: Duration = Duration::from_secs(15);
const TOTP_NAV_TIMEOUT: Duration = Duration::from_secs(10);

const USERNAME_SELECTORS: &[&str] = &[
    "input[type=\"email\"]",
    "input[name=\"username\"]",
    "input[name=\"email\"]",
    "input[name=\"login\"]",
    "input[id*=\"user\" i]",
    "input[id*=\"email\" i]",
    "input[autocomplete=\"username\"]",
    "input[type=\"text\"]",
];

const PASSWORD_SELECTORS: &[&str] = &[
    "input[type=\"password\"]",
    "input[name=\"password\"]",
    "input[id*=\"pass\" i]",
];

const SUBMIT_SELECTORS: &[&str] = &[
    "button[type=\"submit\"]",
    "input[type=\"submit\"]",
    "button[id*=\"login\" i]",
    "button[class*=\"login\" i]",
    "button[class*=\"signin\" i]",
    "button[class*=\"submit\" i]",
];

const TOTP_INPUT_SELECTORS: &[&str] = &[
    "input[autocomplete=\"one-time-code\"]",
    "input[name*=\"code\" i]",
    "input[id*=\"code\" i]",
    "input[name*=\"otp\" i]",
    "input[type=\"tel\"]",
    "input[type=\"text\"]",
];

/// Page text that signals a TOTP challenge.
const TOTP_KEYWORDS: &[&str] = &[
    "verification code",
    "authenticator",
    "two-factor",
    "2fa",
    "one-time password",
    "enter code",
    "otp",
];

/// One full login attempt on a fresh page. Persists cookies on success.
pub async fn run_login(session: &SessionManager, pool: &BrowserPool, url: &str) -> Result<()> {
    let lease = pool.borrow_page().await?;
    let outcome = attempt(session, &lease, url).await;
    lease.dispose().await;
    outcome
}

async fn attempt(session: &SessionManager, lease: &PageLease, url: &str) -> Result<()> {
    tokio::time::timeout(LOGIN_NAV_TIMEOUT, lease.navigate(url))
        .await
        .context("login navigation timed out")??;

    let config = session.config();
    let username = config
        .gym_username
        .as_deref()
        .context("username not configured")?;
    let password = config
        .gym_password
        .as_deref()
        .context("password not configured")?;

    // Locate the form: common selectors first, planner as fallback.
    let mut user_el = find_first(lease, USERNAME_SELECTORS).await;
    let mut pass_el = find_first(lease, PASSWORD_SELECTORS).await;

    if user_el.is_none() || pass_el.is_none() {
        if let Some(planner) = session.planner() {
            let html = lease.html().await.unwrap_or_default();
            if let Some(selectors) = planner.login_selectors(&html).await {
                debug!("using planner-provided login selectors");
                if user_el.is_none() {
                    user_el = lease.page().find_element(&selectors.username).await.ok();
                }
                if pass_el.is_none() {
                    pass_el = lease.page().find_element(&selectors.password).await.ok();
                }
            }
        }
    }

    let user_el = user_el.context("no username field found")?;
    let pass_el = pass_el.context("no password field found")?;

    stealth::type_human(&user_el, username).await?;
    stealth::type_human(&pass_el, password).await?;
    submit(lease, &pass_el).await?;

    let _ = tokio::time::timeout(LOGIN_NAV_TIMEOUT, lease.page().wait_for_navigation()).await;

    // TOTP challenge, when the page asks and a seed is configured.
    let html = lease.html().await.unwrap_or_default();
    if is_totp_challenge(&html) {
        let secret = config
            .gym_totp_secret
            .as_deref()
            .context("site asked for a one-time code but no TOTP secret is configured")?;
        let code = totp::generate(secret)?;

        let code_el = find_first(lease, TOTP_INPUT_SELECTORS)
            .await
            .context("no one-time code field found")?;
        stealth::type_human(&code_el, &code).await?;
        submit(lease, &code_el).await?;
        let _ = tokio::time::timeout(TOTP_NAV_TIMEOUT, lease.page().wait_for_navigation()).await;
    }

    // Success means the password prompt is gone.
    if lease.page().find_element("input[type=\"password\"]").await.is_ok() {
        bail!("password field still present after submit");
    }

    session
        .persist_cookies(lease)
        .await
        .context("persisting cookies after login")?;
    Ok(())
}

/// Click a submit control if one exists, otherwise press Enter in the field.
async fn submit(lease: &PageLease, field: &Element) -> Result<()> {
    if let Some(button) = find_first(lease, SUBMIT_SELECTORS).await {
        stealth::click_human(lease.page(), &button).await
    } else {
        field.focus().await?;
        field.press_key("Enter").await?;
        Ok(())
    }
}

async fn find_first(lease: &PageLease, selectors: &[&str]) -> Option<Element> {
    for selector in selectors {
        if let Ok(el) = lease.page().find_element(*selector).await {
            return Some(el);
        }
    }
    None
}

fn is_totp_challenge(html: &str) -> bool {
    let lower = html.to_lowercase();
    TOTP_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totp_challenge_detection() {
        assert!(is_totp_challenge("<p>Enter your verification code</p>"));
        assert!(is_totp_challenge("<h1>Two-Factor Authentication</h1>"));
        assert!(is_totp_challenge("please provide the OTP from your app"));
        assert!(!is_totp_challenge("<p>Welcome back, coach</p>"));
    }
}
