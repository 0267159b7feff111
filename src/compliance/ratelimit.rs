//! Per-host request pacing.
//!
//! Two policies exist: the page limiter (one request at a time, a configured
//! floor between requests) and the API limiter used by day workers (three in
//! flight, 500 ms floor, and a small burst reservoir refilled on a fixed
//! window). Waiters are served in arrival order: the concurrency gate is a
//! fair semaphore, and interval slots are handed out under the same lock
//! order the semaphore releases.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Pacing policy for one limiter.
#[derive(Debug, Clone, Copy)]
pub struct LimiterPolicy {
    pub max_concurrency: usize,
    pub min_interval: Duration,
    /// Burst reservoir: `(tokens, refill_window)`.
    pub burst: Option<(u32, Duration)>,
}

impl LimiterPolicy {
    /// Page-level policy: strict serialization at `rate_limit_ms` spacing.
    pub fn page(rate_limit_ms: u64) -> Self {
        Self {
            max_concurrency: 1,
            min_interval: Duration::from_millis(rate_limit_ms),
            burst: None,
        }
    }

    /// Day-worker API policy: 3 concurrent, 500 ms floor, 5-token reservoir
    /// refilled every 10 s.
    pub fn api() -> Self {
        Self {
            max_concurrency: 3,
            min_interval: Duration::from_millis(500),
            burst: Some((5, Duration::from_secs(10))),
        }
    }
}

struct BurstState {
    tokens: u32,
    window_start: Instant,
}

/// A FIFO rate limiter. Callers `acquire()` and hold the returned permit for
/// the duration of the request.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
    burst: Option<(u32, Duration, Mutex<BurstState>)>,
}

/// Held for the duration of one request; releases the concurrency slot on drop.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(policy: LimiterPolicy) -> Self {
        let now = Instant::now();
        Self {
            semaphore: Arc::new(Semaphore::new(policy.max_concurrency)),
            min_interval: policy.min_interval,
            next_slot: Mutex::new(now),
            burst: policy.burst.map(|(tokens, window)| {
                (
                    tokens,
                    window,
                    Mutex::new(BurstState {
                        tokens,
                        window_start: now,
                    }),
                )
            }),
        }
    }

    /// Wait for a slot. Returns once this caller may issue its request.
    pub async fn acquire(&self) -> RatePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore never closes");

        if let Some((reservoir, window, state)) = &self.burst {
            self.take_burst_token(*reservoir, *window, state).await;
        }

        // Claim the next interval slot, then sleep until it arrives.
        let wake_at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = if *next > now { *next } else { now };
            *next = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(wake_at).await;

        RatePermit { _permit: permit }
    }

    async fn take_burst_token(&self, reservoir: u32, window: Duration, state: &Mutex<BurstState>) {
        loop {
            let wait_until = {
                let mut s = state.lock().await;
                let now = Instant::now();
                if now.duration_since(s.window_start) >= window {
                    s.tokens = reservoir;
                    s.window_start = now;
                }
                if s.tokens > 0 {
                    s.tokens -= 1;
                    return;
                }
                s.window_start + window
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_page_limiter_serializes() {
        let limiter = Arc::new(RateLimiter::new(LimiterPolicy::page(50)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_min_interval_spacing() {
        let limiter = RateLimiter::new(LimiterPolicy::page(40));
        let start = Instant::now();
        for _ in 0..3 {
            let _p = limiter.acquire().await;
        }
        // Third acquisition cannot start before two full intervals elapsed.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_api_limiter_allows_three_concurrent() {
        let limiter = Arc::new(RateLimiter::new(LimiterPolicy {
            max_concurrency: 3,
            min_interval: Duration::from_millis(1),
            burst: None,
        }));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_reservoir_blocks_sixth_caller() {
        let limiter = Arc::new(RateLimiter::new(LimiterPolicy {
            max_concurrency: 10,
            min_interval: Duration::from_millis(0),
            burst: Some((5, Duration::from_secs(10))),
        }));

        let start = Instant::now();
        for _ in 0..5 {
            let _p = limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        // Sixth draws an empty reservoir and must wait for the refill window.
        let _p = limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
