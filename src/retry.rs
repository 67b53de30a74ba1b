//! Classified retry with exponential backoff
//!
//! Any zero-argument async operation can be wrapped. The policy is passed in
//! explicitly so it can be tested apart from the calls it protects.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{GmailError, Result};

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fatal,
}

/// Maps a failure onto a [`RetryDecision`]
pub type Classifier = fn(&GmailError) -> RetryDecision;

/// Default classifier: rate limits, 5xx and transport failures are retried;
/// auth, not-found, malformed requests and everything else are fatal.
pub fn classify(error: &GmailError) -> RetryDecision {
    if error.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Fatal
    }
}

/// Immutable retry policy for one call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Cap on a single backoff delay, before jitter
    pub max_delay: Duration,
    /// Upper bound of the random delay added on top of each backoff
    pub jitter: Option<Duration>,
    /// Stop retrying once the next sleep would run past this budget
    pub deadline: Option<Duration>,
    pub classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: (config.jitter_ms > 0).then(|| Duration::from_millis(config.jitter_ms)),
            deadline: config.deadline_secs.map(Duration::from_secs),
            classifier: classify,
        }
    }

    /// Policy with no jitter, no deadline and an uncapped delay
    pub fn exponential(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
            max_delay: Duration::MAX,
            jitter: None,
            deadline: None,
            classifier: classify,
        }
    }

    /// A single attempt, never retried
    pub fn no_retry() -> Self {
        Self::exponential(0, Duration::ZERO, 1.0)
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Backoff before retry number `retry` (0-based), without jitter:
    /// `min(base_delay * multiplier^retry, max_delay)`
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        match self.jitter {
            Some(bound) if !bound.is_zero() => {
                let extra = rand::thread_rng().gen_range(0..=bound.as_millis() as u64);
                delay.saturating_add(Duration::from_millis(extra))
            }
            _ => delay,
        }
    }
}

/// Progress of a retried operation, reported to observers
#[derive(Debug)]
pub enum RetryEvent<'a> {
    /// Attempt number `attempt` (1-based) is about to run
    Attempt { attempt: u32 },
    /// Attempt failed retryably; sleeping `delay` before the next one
    Retrying {
        attempt: u32,
        delay: Duration,
        error: &'a GmailError,
    },
    /// No further attempts; the error is returned to the caller
    GaveUp { attempts: u32, error: &'a GmailError },
}

/// Execute `operation` under `policy`
///
/// The last error is returned unchanged once retries are exhausted, a fatal
/// error is returned immediately.
pub async fn with_retry<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_observed(operation_name, policy, operation, |_| {}).await
}

/// [`with_retry`] with a callback for every [`RetryEvent`]
pub async fn retry_observed<T, F, Fut, O>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
    mut observer: O,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    O: FnMut(&RetryEvent<'_>),
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        observer(&RetryEvent::Attempt { attempt });

        let error = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        let retries_done = attempt - 1;
        let retryable = (policy.classifier)(&error) == RetryDecision::Retry;
        if !retryable || retries_done >= policy.max_retries {
            if retryable {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation_name, attempt, error
                );
            }
            observer(&RetryEvent::GaveUp {
                attempts: attempt,
                error: &error,
            });
            return Err(error);
        }

        let delay = policy.jittered_delay(retries_done);
        if let Some(deadline) = policy.deadline {
            if started.elapsed().saturating_add(delay) > deadline {
                warn!(
                    "{} failed (attempt {}): {}. Next retry would pass the {:?} deadline",
                    operation_name, attempt, error, deadline
                );
                observer(&RetryEvent::GaveUp {
                    attempts: attempt,
                    error: &error,
                });
                return Err(error);
            }
        }

        warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
            operation_name,
            attempt,
            policy.max_retries + 1,
            error,
            delay
        );
        observer(&RetryEvent::Retrying {
            attempt,
            delay,
            error: &error,
        });
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, Duration::from_millis(1), 2.0)
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&GmailError::RateLimitExceeded { retry_after: 1 }),
            RetryDecision::Retry
        );
        assert_eq!(
            classify(&GmailError::ServerError {
                status: 503,
                message: "unavailable".to_string()
            }),
            RetryDecision::Retry
        );
        assert_eq!(
            classify(&GmailError::NetworkError("reset".to_string())),
            RetryDecision::Retry
        );
        assert_eq!(
            classify(&GmailError::AuthError("invalid token".to_string())),
            RetryDecision::Fatal
        );
        assert_eq!(
            classify(&GmailError::MessageNotFound("m1".to_string())),
            RetryDecision::Fatal
        );
        assert_eq!(
            classify(&GmailError::BadRequest("bad query".to_string())),
            RetryDecision::Fatal
        );
    }

    #[test]
    fn test_backoff_delays_are_exponential() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), 2.0);
        let delays: Vec<u64> = (0..5).map(|r| policy.backoff_delay(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_delay_capped() {
        let mut policy = RetryPolicy::exponential(10, Duration::from_secs(1), 2.0);
        policy.max_delay = Duration::from_secs(5);
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(60), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            jitter_ms: 250,
            deadline_secs: Some(60),
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.jitter, Some(Duration::from_millis(250)));
        assert_eq!(policy.deadline, Some(Duration::from_secs(60)));
        assert!(RetryPolicy::default().jitter.is_none());
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(100), 2.0).with_jitter(Duration::from_millis(50));
        for _ in 0..50 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_transient_failures_then_success() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), 2.0);
        let calls = Arc::new(AtomicU32::new(0));
        let mut delays = Vec::new();
        let start = Instant::now();

        let result = retry_observed(
            "test_op",
            &policy,
            || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 5 {
                        Err(GmailError::ServerError {
                            status: 503,
                            message: "busy".to_string(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            },
            |event| {
                if let RetryEvent::Retrying { delay, .. } = event {
                    delays.push(delay.as_secs());
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(start.elapsed(), Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));

        let result = with_retry("test_op", &fast_policy(3), || {
            let count = Arc::clone(&attempt_count);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GmailError::NetworkError("Connection timeout".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let attempt_count = Arc::new(AtomicU32::new(0));

        let result = with_retry("test_op", &fast_policy(3), || {
            let count = Arc::clone(&attempt_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(GmailError::AuthError("Invalid credentials".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(GmailError::AuthError(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_all_retries_and_keeps_last_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));

        let result = with_retry("test_op", &fast_policy(3), || {
            let count = Arc::clone(&attempt_count);
            async move {
                let n = count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(GmailError::ServerError {
                    status: 500 + n as u16,
                    message: "still failing".to_string(),
                })
            }
        })
        .await;

        // initial + 3 retries, last error unchanged
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
        match result {
            Err(GmailError::ServerError { status, .. }) => assert_eq!(status, 503),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_retry_policy_single_attempt() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let result = with_retry("test_op", &RetryPolicy::no_retry(), || {
            let count = Arc::clone(&attempt_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GmailError::RateLimitExceeded { retry_after: 1 })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_before_sleeping() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), 2.0)
            .with_deadline(Duration::from_secs(10));
        let attempt_count = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = with_retry("test_op", &policy, || {
            let count = Arc::clone(&attempt_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GmailError::NetworkError("down".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(GmailError::NetworkError(_))));
        // Sleeps 1 + 2 + 4 = 7s; the next 8s sleep would pass the deadline
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        fn everything_fatal(_: &GmailError) -> RetryDecision {
            RetryDecision::Fatal
        }
        let policy = fast_policy(5).with_classifier(everything_fatal);
        let attempt_count = Arc::new(AtomicU32::new(0));

        let _ = with_retry("test_op", &policy, || {
            let count = Arc::clone(&attempt_count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GmailError::NetworkError("reset".to_string()))
            }
        })
        .await;
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_gave_up() {
        let mut events = Vec::new();
        let _ = retry_observed(
            "test_op",
            &fast_policy(1),
            || async { Err::<(), _>(GmailError::NetworkError("reset".to_string())) },
            |event| {
                events.push(match event {
                    RetryEvent::Attempt { .. } => "attempt",
                    RetryEvent::Retrying { .. } => "retrying",
                    RetryEvent::GaveUp { .. } => "gave_up",
                })
            },
        )
        .await;
        assert_eq!(events, vec!["attempt", "retrying", "attempt", "gave_up"]);
    }
}
