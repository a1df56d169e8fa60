#![forbid(unsafe_code)]

use crate::error::StoreError;
use rand::Rng;
use std::time::Duration;

/// Randomised backoff for transient store failures.
///
/// Delays are drawn uniformly from `[min_delay, early_max]` for the first
/// `early_attempts` retries and from `[min_delay, late_max]` afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub early_attempts: u32,
    pub min_delay: Duration,
    pub early_max: Duration,
    pub late_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            early_attempts: 3,
            min_delay: Duration::from_secs(1),
            early_max: Duration::from_secs(16),
            late_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same shape as the default with millisecond delays.
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            early_attempts: 3,
            min_delay: Duration::from_millis(1),
            early_max: Duration::from_millis(5),
            late_max: Duration::from_millis(20),
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let max = if retry < self.early_attempts {
            self.early_max
        } else {
            self.late_max
        };
        if max <= self.min_delay {
            return self.min_delay;
        }
        rand::rng().random_range(self.min_delay..=max)
    }

    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        op = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store error; retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(op = what, attempt, error = %err, "store retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
