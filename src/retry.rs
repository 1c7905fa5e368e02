//! Backoff policies and the transient-failure retry executor.
//!
//! Persistence calls that fail with a transient classification (timeouts,
//! throttling, brief unavailability) are retried in place under
//! [`RetryPolicy`]. Everything else surfaces on first sight; the caller's
//! predicate decides which is which.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Default exponential multiplier when not specified.
pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;

/// An exponential backoff schedule with a hard deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_coefficient: f64,
    /// Ceiling for any single delay.
    pub max_interval: Duration,
    /// Total time budget across all attempts. Exhaustion surfaces the last
    /// error.
    pub expiration_interval: Duration,
}

impl RetryPolicy {
    /// The schedule used for execution-store operations: quick first retry,
    /// doubling up to one second, giving up after thirty.
    pub fn persistence_default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            max_interval: Duration::from_secs(1),
            expiration_interval: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// elapsed budget is spent.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.expiration_interval {
            return None;
        }
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_interval.as_millis() as f64 * self.backoff_coefficient.powi(exp);
        let capped = raw.min(self.max_interval.as_millis() as f64) as u64;
        Some(Duration::from_millis(capped))
    }
}

/// Multiply a delay by a random factor in [0.8, 1.2) so synchronized
/// retries fan out.
fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

static PERSISTENCE_RETRY_POLICY: OnceLock<RetryPolicy> = OnceLock::new();

/// Install the process-wide persistence retry policy. First caller wins;
/// later calls are ignored. Reads default to
/// [`RetryPolicy::persistence_default`] when never configured.
pub fn configure_persistence_retries(policy: RetryPolicy) {
    let _ = PERSISTENCE_RETRY_POLICY.set(policy);
}

pub fn persistence_retry_policy() -> &'static RetryPolicy {
    PERSISTENCE_RETRY_POLICY.get_or_init(RetryPolicy::persistence_default)
}

/// Run `op` until it succeeds, the policy's budget is spent, or it fails
/// with an error `is_retryable` rejects. The last error is returned on
/// exhaustion.
pub async fn retry<T, E, Op, Fut, P>(mut op: Op, policy: &RetryPolicy, is_retryable: P) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !is_retryable(&err) {
                    return Err(err);
                }
                match policy.next_delay(attempt, started.elapsed()) {
                    Some(delay) => tokio::time::sleep(apply_jitter(delay)).await,
                    None => return Err(err),
                }
            }
        }
    }
}
