//! Request pacing: minimum inter-request interval, retry classification, and
//! capped exponential backoff.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between permitted requests.
///
/// All outbound traffic from one fetcher shares a single instance, so the
/// aggregate rate never exceeds the budget no matter how many workers are in
/// flight. Waiters hold the internal lock across their sleep, which serializes
/// them in FIFO arrival order. Never errors, only delays.
pub struct RateLimiter {
    min_interval: Duration,
    last_permit: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(rps: f64) -> Self {
        let rps = rps.max(1e-4);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            last_permit: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_permit.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.min_interval;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Exponential delay scaled by a random factor in [0.5, 1.5], still capped.
    pub fn jittered_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        base.mul_f64(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn jittered_delay_stays_under_ceiling() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(500),
        };
        for attempt in 0..6 {
            assert!(policy.jittered_delay_for_attempt(attempt) <= policy.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn k_permits_take_at_least_k_minus_one_intervals() {
        let limiter = RateLimiter::new(10.0); // 100ms interval
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait().await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(400),
            "5 permits at 10 rps took {elapsed:?}, expected >= 400ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_budget() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(20.0)); // 50ms interval
        let start = Instant::now();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move {
                limiter.wait().await;
            });
        }
        while tasks.join_next().await.is_some() {}
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(150),
            "4 concurrent permits at 20 rps took {elapsed:?}, expected >= 150ms"
        );
    }
}
