//! Error types for the scan pipeline.
//!
//! One variant per semantic failure kind. Transport and auth errors are
//! recovered locally (browser fallback, session gate); trap, paywall, and
//! persist errors surface to the caller. Normalization failures never appear
//! here — they are absorbed as warnings on the scan outcome.

/// Top-level error for a single URL scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// A required credential or endpoint was absent at startup.
    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    /// The trap detector rejected the URL or its content.
    #[error("trap detected at {url}: {reason}")]
    TrapDetected { url: String, reason: String },

    /// robots.txt disallows this URL for our user agent.
    #[error("robots.txt disallows {0}")]
    RobotsDisallowed(String),

    /// The site answered 402; no fallback path is attempted.
    #[error("paywall (402) at {0}")]
    Paywall(String),

    /// Network or timeout failure on either fetch path.
    #[error("fetch transport failure: {0}")]
    FetchTransport(String),

    /// 401/403 or a password field where content was expected.
    #[error("auth wall: {0}")]
    AuthWall(String),

    /// Every login attempt was exhausted; parked callers are failed together.
    #[error("login failed after {attempts} attempts: {reason}")]
    LoginFailed { attempts: u32, reason: String },

    /// The upsert sink rejected a batch.
    #[error("persist failed: {0}")]
    PersistFailed(String),
}

impl ScanError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::FetchTransport(msg.into())
    }

    pub fn trap(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TrapDetected {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::ConfigMissing("SUPABASE_URL");
        assert_eq!(
            err.to_string(),
            "missing required configuration: SUPABASE_URL"
        );

        let err = ScanError::trap("https://x/a/a/a", "repeated path segment");
        assert!(err.to_string().contains("repeated path segment"));
    }
}
