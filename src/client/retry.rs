//! Attempt-bounded retry with exponential backoff.

use std::{fmt, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Delay schedule between attempts: `initial`, `2 * initial`, `4 * initial`,
/// ... capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

impl Backoff {
    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(31);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Every attempt failed; `last` is the error from the final one.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` up to `max_attempts` times (at least once), sleeping per
/// `backoff` between failures. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    max_attempts: u32,
    backoff: &Backoff,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= max_attempts => {
                return Err(Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            Err(err) => {
                let delay = backoff.delay(attempt);
                warn!(
                    "attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt, max_attempts, err, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
