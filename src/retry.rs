//! Lock acquisition with bounded, jittered exponential backoff.
//!
//! Every market, ticker, pool and account sits behind its own `Mutex`. Callers
//! never block indefinitely: they `try_lock`, back off, and give up with
//! [`LockError::Busy`] once the attempt budget is spent. Nothing has been
//! mutated at that point, so the caller can surface a transient error.

use crate::config::RetryConfig;
use rand::{Rng, RngCore};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("{resource} is busy after {attempts} attempts")]
    Busy { resource: String, attempts: u32 },

    #[error("{resource} lock poisoned by a panicked writer")]
    Poisoned { resource: String },
}

// "Equal jitter": delay is in [backoff/2, backoff].
pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_us = backoff.as_micros() as u64;
    if backoff_us <= 1 {
        return backoff;
    }

    let half_us = backoff_us / 2;
    let jitter_us = rng.gen_range(0..=half_us);
    Duration::from_micros(half_us.saturating_add(jitter_us))
}

fn backoff_for_attempt(policy: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    policy
        .base_delay()
        .saturating_mul(factor)
        .min(policy.max_delay())
}

pub fn lock_with_retry<'a, T>(
    mutex: &'a Mutex<T>,
    policy: &RetryConfig,
    resource: impl FnOnce() -> String,
) -> Result<MutexGuard<'a, T>, LockError> {
    let mut rng = rand::thread_rng();
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => {
                return Err(LockError::Poisoned { resource: resource() });
            }
            Err(TryLockError::WouldBlock) => {
                if attempt + 1 < attempts {
                    std::thread::sleep(jittered_backoff(&mut rng, backoff_for_attempt(policy, attempt)));
                }
            }
        }
    }

    let resource = resource();
    tracing::warn!(%resource, attempts, "lock contention, giving up");
    Err(LockError::Busy { resource, attempts })
}
