//! Human-shaped input: typing cadence, cursor drift, idle pauses.
//!
//! Keystroke gaps are drawn from N(80 ms, 30 ms) clamped to [20, 500] ms,
//! with extra hesitation around spaces and capital letters. Idle behavior
//! between navigation and capture is a couple of cursor drifts, an optional
//! gentle scroll, and a short pause.

use anyhow::Result;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use rand::Rng;
use std::time::Duration;

const KEY_DELAY_MEAN_MS: f64 = 80.0;
const KEY_DELAY_STD_MS: f64 = 30.0;
const KEY_DELAY_MIN_MS: f64 = 20.0;
const KEY_DELAY_MAX_MS: f64 = 500.0;

/// A Gaussian sample via Box-Muller, clamped to the keystroke window.
fn gaussian_delay_ms(mean: f64, std: f64) -> u64 {
    let mut rng = rand::thread_rng();
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (mean + std * z).clamp(KEY_DELAY_MIN_MS, KEY_DELAY_MAX_MS) as u64
}

/// Type text into a focused element one key at a time with human cadence.
pub async fn type_human(element: &Element, text: &str) -> Result<()> {
    element.focus().await?;
    for ch in text.chars() {
        element.type_str(&ch.to_string()).await?;

        let mut delay = gaussian_delay_ms(KEY_DELAY_MEAN_MS, KEY_DELAY_STD_MS);
        // People pause around word boundaries and shift-reaches.
        if ch == ' ' || ch.is_ascii_uppercase() {
            delay += rand::thread_rng().gen_range(40..120);
        }
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(())
}

/// 2-4 cursor drifts, an optional gentle scroll, and a 0.5-1.5 s pause.
pub async fn idle_behavior(page: &Page) -> Result<()> {
    let (drifts, scroll, pause_ms) = {
        let mut rng = rand::thread_rng();
        (
            rng.gen_range(2..=4),
            rng.gen_bool(0.6),
            rng.gen_range(500..=1500),
        )
    };

    for _ in 0..drifts {
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(120.0..1100.0), rng.gen_range(90.0..640.0))
        };
        move_cursor(page, x, y).await?;
        tokio::time::sleep(Duration::from_millis(gaussian_delay_ms(120.0, 40.0))).await;
    }

    if scroll {
        let dy = rand::thread_rng().gen_range(120..420);
        page.evaluate(format!("window.scrollBy({{top: {dy}, behavior: 'smooth'}})"))
            .await?;
    }

    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    Ok(())
}

/// Drift toward an element, then click it.
pub async fn click_human(page: &Page, element: &Element) -> Result<()> {
    // A couple of approach movements before the click reads as a person.
    for _ in 0..2 {
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(200.0..1000.0), rng.gen_range(150.0..600.0))
        };
        move_cursor(page, x, y).await?;
        tokio::time::sleep(Duration::from_millis(gaussian_delay_ms(90.0, 30.0))).await;
    }
    element.scroll_into_view().await?;
    element.click().await?;
    Ok(())
}

async fn move_cursor(page: &Page, x: f64, y: f64) -> Result<()> {
    let params = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseMoved)
        .x(x)
        .y(y)
        .build()
        .map_err(|e| anyhow::anyhow!("mouse event params: {e}"))?;
    page.execute(params).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_delay_clamped() {
        for _ in 0..1000 {
            let d = gaussian_delay_ms(KEY_DELAY_MEAN_MS, KEY_DELAY_STD_MS);
            assert!((20..=500).contains(&d));
        }
    }

    #[test]
    fn test_gaussian_delay_centers_near_mean() {
        let n = 2000u64;
        let total: u64 = (0..n)
            .map(|_| gaussian_delay_ms(KEY_DELAY_MEAN_MS, KEY_DELAY_STD_MS))
            .sum();
        let mean = total / n;
        assert!((60..=100).contains(&mean), "sample mean {mean} out of range");
    }
}
