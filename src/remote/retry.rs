//! Client-side request pacing and retry backoff

use super::RemoteError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Fraction of the backoff delay added as random jitter, at most
pub const JITTER_FRACTION: f64 = 0.1;

/// Minimum-interval throttle shared by every request from one client
///
/// A request may not start before the previous one started plus `interval`.
/// Callers queue on the lock, so requests are also serialized.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next request may start, then record it as started
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                tracing::debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Rate limiting"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retrying after failed attempt `attempt` (0-based)
    ///
    /// `min(base * 2^attempt, max)` stretched by `jitter * 10%`, where
    /// `jitter` is clamped to `[0, 1]`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.min(62) as i32;
        let raw = self.base.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped * (1.0 + JITTER_FRACTION * jitter))
    }

    /// Backoff delay with a fresh random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt, rand::random::<f64>())
    }
}

/// Why an attempt should be retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    /// HTTP 429
    RateLimited,
    Timeout,
    Transport(String),
    /// HTTP 5xx
    Server(u16),
}

impl RetryCause {
    /// Error reported once the retry budget is spent
    pub fn into_error(self, attempts: u32) -> RemoteError {
        match self {
            RetryCause::RateLimited => RemoteError::RateLimited { attempts },
            RetryCause::Timeout => RemoteError::Timeout { attempts },
            RetryCause::Transport(message) => RemoteError::Transport { attempts, message },
            RetryCause::Server(status) => RemoteError::ServerError { status, attempts },
        }
    }
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCause::RateLimited => write!(f, "rate limited"),
            RetryCause::Timeout => write!(f, "timed out"),
            RetryCause::Transport(message) => write!(f, "{}", message),
            RetryCause::Server(status) => write!(f, "server error {}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3, 0.0), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(10, 0.0), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(u32::MAX, 0.0), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounded_to_ten_percent() {
        let policy = RetryPolicy::default();
        let max = policy.backoff_delay(2, 1.0);
        assert!((max.as_secs_f64() - 4.4).abs() < 1e-6);
        assert_eq!(policy.backoff_delay(2, 7.0), max);
        assert_eq!(policy.backoff_delay(2, f64::NAN), Duration::from_secs(4));

        for _ in 0..100 {
            let d = policy.next_delay(2);
            assert!(d >= Duration::from_secs(4) && d <= max, "{:?}", d);
        }
    }

    #[test]
    fn test_attempts_include_first_try() {
        assert_eq!(RetryPolicy::default().attempts(), 4);
        let none = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(none.attempts(), 1);
    }

    #[test]
    fn test_retry_cause_into_error() {
        assert!(matches!(
            RetryCause::RateLimited.into_error(4),
            RemoteError::RateLimited { attempts: 4 }
        ));
        assert!(matches!(
            RetryCause::Server(503).into_error(2),
            RemoteError::ServerError {
                status: 503,
                attempts: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_no_wait_after_idle() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
