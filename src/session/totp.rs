//! RFC 6238 time-based one-time passwords.
//!
//! HMAC-SHA1 over a 30-second counter with dynamic truncation, 6 digits.
//! Secrets are base32 (RFC 4648), case-insensitive, padding optional, and
//! must decode to at least one byte.

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Generate the current TOTP code for a base32 secret.
pub fn generate(secret_base32: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    generate_at(secret_base32, now)
}

/// Generate the TOTP code for a specific unix time, for verification and tests.
pub fn generate_at(secret_base32: &str, unix_secs: u64) -> Result<String> {
    let cleaned: String = secret_base32
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_uppercase();

    let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &cleaned)
        .filter(|k| !k.is_empty());
    let Some(key) = key else {
        bail!("TOTP secret is not valid base32");
    };

    let counter = unix_secs / TOTP_STEP_SECS;
    let mut mac = Hmac::<Sha1>::new_from_slice(&key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[19] & 0x0f) as usize;
    let binary = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// "12345678901234567890" in base32, the RFC 6238 SHA-1 test secret.
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vectors() {
        // RFC 6238 Appendix B values, truncated from 8 to 6 digits.
        assert_eq!(generate_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(generate_at(RFC_SECRET, 1_111_111_109).unwrap(), "081804");
        assert_eq!(generate_at(RFC_SECRET, 1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn test_one_byte_secret_accepted() {
        // "ME" decodes to a single byte.
        let code = generate_at("ME", 59).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_lowercase_and_padding_tolerated() {
        let padded = format!("{}==", RFC_SECRET.to_lowercase());
        assert_eq!(generate_at(&padded, 59).unwrap(), "287082");
    }

    #[test]
    fn test_invalid_secret_rejected() {
        assert!(generate_at("", 59).is_err());
        assert!(generate_at("!!!!", 59).is_err());
    }

    #[test]
    fn test_stable_within_step() {
        let a = generate_at(RFC_SECRET, 60).unwrap();
        let b = generate_at(RFC_SECRET, 89).unwrap();
        let c = generate_at(RFC_SECRET, 90).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
