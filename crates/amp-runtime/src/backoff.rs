//! Backoff
//!
//! Jitter, exponential backoff clocks and the bounded retry policy used by
//! resource loading.

use std::fmt::Display;
use std::future::Future;
use std::rc::Rc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::timer::Timer;

/// `(value, fraction) -> offset` added to a delay.
pub type JitterFn = Rc<dyn Fn(f64, f64) -> f64>;

/// Random offset of up to `fraction * value`, either sign.
pub fn random_jitter(value: f64, fraction: f64) -> f64 {
    let mut rng = rand::rng();
    let jitter = value * fraction * rng.random::<f64>();
    if rng.random_bool(0.5) { -jitter } else { jitter }
}

/// Jitter that never moves the delay. Handy for deterministic tests.
pub fn no_jitter(_value: f64, _fraction: f64) -> f64 {
    0.0
}

/// The default jitter source.
pub fn default_jitter() -> JitterFn {
    Rc::new(random_jitter)
}

/// Shape of an exponential backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    /// First delay, in milliseconds.
    pub base_ms: f64,
    /// Growth factor between consecutive delays.
    pub factor: f64,
    /// Jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 700.0,
            factor: 2.0,
            jitter: 0.3,
        }
    }
}

/// Stateful producer of increasing delays.
///
/// Each call to [`next_delay`](Self::next_delay) returns
/// `base * factor^n` plus jitter, where `n` counts previous calls.
pub struct BackoffClock {
    config: BackoffConfig,
    count: u32,
    jitter: JitterFn,
}

impl BackoffClock {
    pub fn new(config: BackoffConfig, jitter: JitterFn) -> Self {
        Self {
            config,
            count: 0,
            jitter,
        }
    }

    /// Next delay in milliseconds.
    pub fn next_delay(&mut self) -> u64 {
        let exp = self.count.min(31) as i32;
        self.count = self.count.saturating_add(1);
        let wait = self.config.base_ms * self.config.factor.max(1.0).powi(exp);
        let wait = wait + (self.jitter)(wait, self.config.jitter);
        wait.max(0.0).round() as u64
    }

    /// Delays handed out so far.
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl std::fmt::Debug for BackoffClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffClock")
            .field("config", &self.config)
            .field("count", &self.count)
            .finish()
    }
}

/// Bounded retry with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub factor: f64,
    /// Jitter fraction applied to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 5000,
            factor: 1.5,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32, jitter: &dyn Fn(f64, f64) -> f64) -> u64 {
        let exp = retry.min(31) as i32;
        let base = self.base_delay_ms as f64 * self.factor.max(1.0).powi(exp);
        (base + jitter(base, self.jitter)).max(0.0).round() as u64
    }
}

/// Result of [`with_retry_outcome`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the policy's attempts run out.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timer: &Timer,
    jitter: &JitterFn,
    operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_outcome(policy, timer, jitter, operation).await.result
}

/// Like [`with_retry`], also reporting how many attempts were made.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    timer: &Timer,
    jitter: &JitterFn,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) if attempts < max_attempts => {
                let delay = policy.delay_for_retry(attempts - 1, jitter.as_ref());
                tracing::debug!(attempt = attempts, delay, error = %err, "retrying after failure");
                // The promise id never escapes, so it cannot be cancelled.
                let _ = timer.promise(delay, ()).await;
            }
            Err(err) => {
                tracing::debug!(attempts, error = %err, "giving up");
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }
        }
    }
}
