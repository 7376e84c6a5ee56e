use exponential_backoff::Backoff;
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential polling: `base_delay * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> Backoff {
        let mut backoff = Backoff::new(self.max_attempts.max(1), self.base_delay, self.max_delay);
        backoff.set_factor(self.multiplier.max(1));
        backoff.set_jitter(0.0);
        backoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
}

/// Calls `check` until it yields a value, sleeping between attempts.
///
/// Makes exactly `max_attempts` calls before returning `Exhausted`, with no
/// sleep after the last one. Errors from `check` abort the poll immediately.
pub async fn poll_until<T, E, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    mut check: F,
) -> Result<Result<T, Exhausted>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = policy.backoff().into_iter();
    for attempt in 1..=max_attempts {
        if let Some(value) = check(attempt).await? {
            debug!("{} ready after {} attempts", name, attempt);
            return Ok(Ok(value));
        }
        if attempt == max_attempts {
            break;
        }
        // the schedule may run dry before the attempt budget does
        let delay = delays.next().flatten().unwrap_or(policy.max_delay);
        debug!("{} not ready, backing off for {:?}", name, delay);
        tokio::time::sleep(delay).await;
    }
    warn!("{} exceeded maximum poll attempts ({})", name, max_attempts);
    Ok(Err(Exhausted {
        attempts: max_attempts,
    }))
}
