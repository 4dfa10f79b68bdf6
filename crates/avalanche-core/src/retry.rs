//! Bounded retry with pluggable backoff.
//!
//! A [`RetryPolicy`] is handed to whatever issues remote calls. It decides how
//! many attempts are made and how long to wait between them; the caller
//! decides which errors are worth retrying.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// The same delay before every retry.
    Fixed(Duration),
    /// `initial * multiplier^(retry - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = retry.saturating_sub(1) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Retry policy: maximum attempts plus a backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Backoff::None)
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` counts the first call; zero is treated as one.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter: false,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Enable or disable up to 50% additive random jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry`, without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.delay(retry)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..0.5);
        delay + delay.mul_f64(extra)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.jittered(self.delay_for(attempt));
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
