// =============================================================================
// Retry with exponential backoff and jitter
// =============================================================================
//
// Single retry primitive shared by the market-data provider and the order
// executor. Delay for attempt `n` (zero-based) is:
//
//   initial * 2^n, +/- up to `jitter` fraction, capped at `max_backoff`
//
// An error may opt out of further retries by reporting itself non-retryable
// (permanent rejections, explicit rate-limit signals). A deadline, when
// given, bounds the total time spent including sleeps.
// =============================================================================

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

/// Implemented by error types that can tell the retry loop whether another
/// attempt could plausibly succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Backoff schedule for one operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 = single attempt).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the delay randomised away in either direction, [0, 1].
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(120),
            jitter: 0.25,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::from_secs(0))
    }

    /// Delay before retry number `attempt` (zero-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            (capped * (1.0 + spread)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Run `op` with the given policy, retrying retryable failures.
///
/// `op` receives the zero-based attempt number. The loop stops early when:
/// - the error reports itself non-retryable, or
/// - the deadline would be exceeded by the next backoff sleep.
///
/// Returns the last error when all attempts are spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    deadline: Option<Instant>,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display + Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err.is_retryable() && attempt < policy.max_retries;
                if !retryable {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        warn!(
                            op = op_name,
                            attempt,
                            "deadline reached — abandoning retries"
                        );
                        return Err(err);
                    }
                }

                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            retry_with_backoff(&fast_policy(5), "test", None, |_| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError { retryable: true })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            retry_with_backoff(&fast_policy(5), "test", None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: false })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            retry_with_backoff(&fast_policy(3), "test", None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: true })
            })
            .await;
        assert!(result.is_err());
        // 1 initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn deadline_stops_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
        };
        let deadline = Instant::now() + Duration::from_millis(10);
        let result: Result<u32, TestError> =
            retry_with_backoff(&policy, "test", Some(deadline), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: true })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy {
            max_retries: 20,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(600),
            jitter: 0.25,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "delay {d} outside jitter band");
        }
    }
}
