use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{PacingSection, RetrySection};
use crate::driver::DriverResult;

/// Bounded retry with a fixed inter-attempt delay, applied uniformly
/// around UI driver calls. Non-transient errors are returned immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Runs `operation` against `target` up to `max_attempts` times.
    ///
    /// The target is threaded through explicitly so the closure can hold
    /// a mutable driver borrow across attempts. The zero-based attempt
    /// number lets callers escalate their strategy on later tries.
    pub async fn run_with<Ctx, T, F>(
        &self,
        what: &str,
        target: &mut Ctx,
        mut operation: F,
    ) -> DriverResult<RetryOutcome<T>>
    where
        Ctx: ?Sized,
        F: for<'a> FnMut(&'a mut Ctx, usize) -> BoxFuture<'a, DriverResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(target, attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    if !error.is_transient() {
                        return Err(error);
                    }
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(what, attempts = attempt, error = %error, "retry exhausted");
                        return Err(error);
                    }
                    warn!(what, attempt, error = %error, "retrying after transient failure");
                    if !self.delay.is_zero() {
                        sleep(self.delay).await;
                    }
                }
            }
        }
    }
}

/// Randomized scheduling delays, not a correctness mechanism. Three tiers:
/// between dropdown interactions, between leaf units, and the longer
/// anti-throttle pause between top-level entries. A `[0, 0]` range
/// disables a tier, which is how tests run without pauses.
#[derive(Debug, Clone)]
pub struct Pacer {
    interaction_ms: (u64, u64),
    unit_ms: (u64, u64),
    entry_ms: (u64, u64),
}

impl Pacer {
    pub fn new(config: &PacingSection) -> Self {
        Self {
            interaction_ms: (config.interaction_delay_ms[0], config.interaction_delay_ms[1]),
            unit_ms: (config.unit_delay_ms[0], config.unit_delay_ms[1]),
            entry_ms: (config.entry_delay_ms[0], config.entry_delay_ms[1]),
        }
    }

    pub fn disabled() -> Self {
        Self {
            interaction_ms: (0, 0),
            unit_ms: (0, 0),
            entry_ms: (0, 0),
        }
    }

    pub async fn between_interactions(&self) -> u64 {
        Self::wait(self.interaction_ms).await
    }

    pub async fn between_units(&self) -> u64 {
        Self::wait(self.unit_ms).await
    }

    pub async fn between_entries(&self) -> u64 {
        Self::wait(self.entry_ms).await
    }

    async fn wait(range: (u64, u64)) -> u64 {
        if range.0 == 0 && range.1 == 0 {
            return 0;
        }
        let lower = range.0.min(range.1);
        let upper = range.0.max(range.1);
        let delay = rand::thread_rng().gen_range(lower..=upper);
        sleep(Duration::from_millis(delay)).await;
        delay
    }
}
