//! Attempt-counted retry loop with pluggable policy and sleeper.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::ReplicaError;

/// Decides whether a failed attempt is retried.
///
/// `attempt` is the 1-based number of the attempt that just failed. `None`
/// stops, `Some(Duration::ZERO)` retries immediately, anything else waits.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32, error: &ReplicaError) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(u32, &ReplicaError) -> Option<Duration> + Send + Sync,
{
    fn next_delay(&self, attempt: u32, error: &ReplicaError) -> Option<Duration> {
        self(attempt, error)
    }
}

/// Exponential backoff: `base`, doubled per attempt, capped at `max`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            let next = delay.checked_mul(2).unwrap_or(self.max);
            delay = std::cmp::min(next, self.max);
        }
        std::cmp::min(delay, self.max)
    }
}

impl RetryPolicy for BackoffPolicy {
    fn next_delay(&self, attempt: u32, error: &ReplicaError) -> Option<Duration> {
        if attempt >= self.max_attempts || !error.is_transient() {
            return None;
        }
        if error.is_instant_retry() {
            return Some(Duration::ZERO);
        }
        Some(self.delay_for(attempt))
    }
}

/// Source of backoff delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed()
    }
}

/// A successful result together with the errors of the attempts before it.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub failures: Vec<ReplicaError>,
}

impl<T> Retried<T> {
    pub fn attempts(&self) -> u32 {
        self.failures.len() as u32 + 1
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Retried<U> {
        Retried {
            value: f(self.value),
            failures: self.failures,
        }
    }
}

/// Run `attempt` until it succeeds or `policy` gives up.
///
/// A first-attempt failure the policy refuses to retry is returned as is;
/// otherwise exhaustion wraps the last error with the full history.
pub async fn run_with_retries<T, F, Fut>(
    operation: &str,
    policy: &dyn RetryPolicy,
    sleeper: &dyn Sleeper,
    mut attempt: F,
) -> Result<Retried<T>, ReplicaError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ReplicaError>>,
{
    let mut failures = Vec::new();
    let mut number = 0;

    loop {
        number += 1;
        let error = match attempt(number).await {
            Ok(value) => return Ok(Retried { value, failures }),
            Err(error) => error,
        };

        let Some(delay) = policy.next_delay(number, &error) else {
            if failures.is_empty() {
                return Err(error);
            }
            tracing::warn!("{} failed on final attempt {}: {}", operation, number, error);
            failures.push(error.clone());
            return Err(ReplicaError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: number,
                last: Box::new(error),
                history: failures,
            });
        };

        tracing::warn!(
            "{} failed on attempt {}, retrying in {:?}: {}",
            operation,
            number,
            delay,
            error
        );
        failures.push(error);
        if !delay.is_zero() {
            sleeper.sleep(delay).await;
        }
    }
}
