//! Bounded connect policy: per-attempt timeout plus exponential backoff.
//!
//! A connector whose `connect` never settles would otherwise hang the
//! bootstrap forever. [`connect_with_policy`] wraps every attempt in a
//! deadline, retries failed attempts with jittered exponential backoff,
//! and gives up with [`DbError::Exhausted`] once the retry budget is
//! spent.

use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::connector::PersistenceConnector;
use crate::error::DbError;

/// Default per-attempt deadline in milliseconds.
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 5_000;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff base in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 250;

/// Default backoff cap in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// How hard to try before persistence failure becomes fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Deadline applied to each individual attempt.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt (0 means a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each following retry.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay (before jitter).
    pub max_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl ConnectPolicy {
    /// A policy that makes one attempt with the given deadline.
    pub const fn single_attempt(attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Total attempts this policy allows.
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Backoff before retry number `retry` (one-based), without jitter.
///
/// Grows as `base * 2^(retry - 1)` and saturates at `max`. Retry `0`
/// has no delay.
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Add up to 10% random jitter so restarted replicas do not retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let range_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if range_ms == 0 {
        return delay;
    }
    let jitter = rand::rng().random_range(0..range_ms);
    delay.saturating_add(Duration::from_millis(jitter))
}

/// Run `connector.connect()` under `policy`.
///
/// Returns as soon as one attempt succeeds. Each attempt that errors or
/// exceeds [`ConnectPolicy::attempt_timeout`] is logged; once the retry
/// budget is spent the last error is returned inside
/// [`DbError::Exhausted`].
pub async fn connect_with_policy<C>(connector: &C, policy: &ConnectPolicy) -> Result<(), DbError>
where
    C: PersistenceConnector,
{
    let max_attempts = policy.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        let outcome = match tokio::time::timeout(policy.attempt_timeout, connector.connect()).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(DbError::Timeout {
                attempt,
                timeout: policy.attempt_timeout,
            }),
        };

        match outcome {
            Ok(()) => {
                info!(store = connector.name(), attempt, "Persistence connected");
                return Ok(());
            }
            Err(e) if attempt >= max_attempts => {
                return Err(DbError::Exhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = with_jitter(backoff_delay(attempt, policy.base_delay, policy.max_delay));
                warn!(
                    store = connector.name(),
                    attempt,
                    max_attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Persistence connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
