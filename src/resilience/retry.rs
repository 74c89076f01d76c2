use crate::core::{DatabaseError, Result, StoreResult};
use log::{error, warn};
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry behaviour for single operations that hit a rate limit.
///
/// Each retry waits `base_delay * 2^u` where `u` is drawn uniformly from
/// `[0, 1)` for every attempt, so with the default base the wait falls
/// between one and two seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay scale for the jittered backoff
    pub base_delay: Duration,
    /// Total attempts including the first one. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Give up once the next sleep would end past this much elapsed time
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: Some(10),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Retry rate limits forever, with no deadline.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    /// Never retry; the first transient failure is returned.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Jittered delay before the next attempt
    pub fn backoff_delay(&self) -> Duration {
        let u: f64 = rand::random();
        self.base_delay.mul_f64(2f64.powf(u))
    }

    /// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
    ///
    /// `op` is called once per attempt and must build a fresh future each time.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                error!("{} failed: {}", label, err);
                return Err(DatabaseError::Store(err));
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                error!("{} still rate limited after {} attempts: {}", label, attempt, err);
                return Err(DatabaseError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.backoff_delay();
            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    error!("{} still rate limited at its {:?} deadline: {}", label, deadline, err);
                    return Err(DatabaseError::DeadlineExceeded(deadline));
                }
            }

            warn!(
                "{} rate limited (attempt {}): {} (backoff={}ms)",
                label,
                attempt,
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Batching for multi-document deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    /// Ids fetched and deleted per request
    pub batch_size: usize,
    /// Fixed wait before retrying a rate limited batch
    pub retry_delay: Duration,
    /// Retries per batch after the first attempt
    pub max_retries: u32,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry_delay: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

impl BatchPolicy {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default().base_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.backoff_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);

        let result = fast()
            .run("count", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(StoreError::TooManyRequests("16500".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<u64> = fast()
            .run("count", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::ConnectionFailed("refused".into()))
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Store(StoreError::ConnectionFailed(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<u64> = fast()
            .max_attempts(3)
            .run("find", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::TooManyRequests("16500".into()))
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline() {
        let policy = RetryPolicy::unbounded()
            .base_delay(Duration::from_millis(10))
            .deadline(Duration::from_millis(50));

        let result: Result<u64> = policy
            .run("find", || async { Err(StoreError::TooManyRequests("16500".into())) })
            .await;

        assert_eq!(result, Err(DatabaseError::DeadlineExceeded(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_keeps_retrying() {
        let calls = AtomicU32::new(0);

        let result = RetryPolicy::unbounded()
            .run("find", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 25 {
                    Err(StoreError::RequestRateTooLarge("busy".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 26);
    }
}
