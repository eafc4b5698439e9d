//! Request budgeting and the timeout/retry wrapper around external calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use newsfeed_shared::{
    Boundary, NewsfeedError, RateLimitConfig, RateLimitMode, Result, RetryPolicy,
};

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Fixed-window request budget, shared by every task of a run.
#[derive(Debug)]
pub struct RateLimiter {
    budget: u32,
    window: Duration,
    mode: RateLimitMode,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(budget: u32, window: Duration, mode: RateLimitMode) -> Self {
        Self {
            budget: budget.max(1),
            window,
            mode,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_window, config.window(), config.mode)
    }

    /// Take one unit of budget. In `Wait` mode this suspends until the
    /// window rolls over; in `FailFast` mode it returns `RateLimitExceeded`.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.started) >= self.window {
                    state.started = now;
                    state.used = 0;
                }
                if state.used < self.budget {
                    state.used += 1;
                    return Ok(());
                }
                self.window
                    .saturating_sub(now.duration_since(state.started))
            };

            match self.mode {
                RateLimitMode::FailFast => {
                    return Err(NewsfeedError::RateLimitExceeded { retry_after: wait });
                }
                RateLimitMode::Wait => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate budget spent, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitedClient
// ---------------------------------------------------------------------------

/// Wraps one kind of external call with the shared budget, a per-attempt
/// timeout, and exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    boundary: Boundary,
}

impl RateLimitedClient {
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            limiter,
            policy,
            boundary: Boundary::default(),
        }
    }

    /// Error class for calls that exhaust their attempts. Defaults to
    /// [`Boundary::Search`].
    pub fn for_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the budget. Every attempt, retries included, spends
    /// one unit. Non-transient errors and `RateLimitExceeded` return
    /// immediately; transient ones are retried up to the attempt cap, after
    /// which the last error is returned in its terminal form.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await?;
            attempt += 1;

            let outcome = match tokio::time::timeout(self.policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(NewsfeedError::Timeout {
                    after: self.policy.timeout,
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff(attempt - 1);
                    warn!(
                        call = label,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => return Err(e.exhausted(attempt, self.boundary)),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_mode_defers_exactly_one_call() {
        let limiter = Arc::new(RateLimiter::new(
            3,
            Duration::from_secs(60),
            RateLimitMode::Wait,
        ));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await.unwrap();
                    Instant::now().duration_since(start)
                })
            })
            .collect();

        let mut waited = Vec::new();
        for h in handles {
            waited.push(h.await.unwrap());
        }
        let deferred = waited
            .iter()
            .filter(|d| **d >= Duration::from_secs(60))
            .count();
        assert_eq!(deferred, 1);
        assert_eq!(waited.iter().filter(|d| d.is_zero()).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_rejects_over_budget() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), RateLimitMode::FailFast);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        match limiter.acquire().await {
            Err(NewsfeedError::RateLimitExceeded { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60), RateLimitMode::Wait));
        let client = RateLimitedClient::new(limiter, policy(3));
        let calls = AtomicU32::new(0);

        let value = client
            .call("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(NewsfeedError::provider_transient("503"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cap_yields_terminal_error() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60), RateLimitMode::Wait));
        let client = RateLimitedClient::new(limiter, policy(3));
        let calls = AtomicU32::new(0);

        let err = client
            .call("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NewsfeedError::provider_transient("502 bad gateway"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60), RateLimitMode::Wait));
        let client = RateLimitedClient::new(limiter, policy(5));
        let calls = AtomicU32::new(0);

        let err = client
            .call("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NewsfeedError::provider_fatal("401 unauthorized"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_and_retries() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60), RateLimitMode::Wait));
        let client = RateLimitedClient::new(limiter, policy(2));
        let calls = AtomicU32::new(0);

        let err = client
            .call("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, NewsfeedError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("timed out"));
        assert_eq!(err.kind(), "provider_error");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_exhausts_into_boundary_class() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60), RateLimitMode::Wait));
        let client =
            RateLimitedClient::new(limiter, policy(2)).for_boundary(Boundary::Delivery);

        let err = client
            .call("deliver", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, NewsfeedError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "delivery_error");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("2 attempts"));
    }
}
