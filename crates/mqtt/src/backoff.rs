//! Exponential backoff for reconnect attempts.
//!
//! After a lost connection the kernel waits an increasing amount of time
//! between attempts instead of hammering a recovering broker:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! The schedule saturates once the delay reaches `max_delay`; unless an
//! explicit attempt cap is set, the saturation point doubles as the give-up
//! limit.

use std::time::Duration;

use thiserror::Error;

/// Raised when the retry budget is spent.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded; the contained value is the limit
    /// that was in effect.
    #[error("maximum number of reconnect attempts exceeded: {0}")]
    MaxAttemptsExceeded(u32),
}

/// Exponential backoff controller.
///
/// Each failed attempt advances the schedule; `reset()` rewinds it when a
/// connection succeeds. Not internally synchronized: owned by the single
/// kernel task.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    /// Explicit cap; when `None` the computed saturation point applies.
    max_attempts: Option<u32>,
    saturation_attempts: u32,
}

impl Backoff {
    /// Creates a backoff growing from `initial` by `multiplier` per attempt,
    /// capped at `max`. Degenerate parameters (`initial >= max` or
    /// `multiplier <= 1`) collapse the schedule to a single attempt.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let saturation_attempts = Self::saturation_attempts(initial, max, multiplier);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            attempt: 0,
            max_attempts: None,
            saturation_attempts,
        }
    }

    /// Number of attempts until `initial * multiplier^n` reaches `max`:
    /// `n = log(max/initial) / log(multiplier)`, floored, plus one.
    fn saturation_attempts(initial: Duration, max: Duration, multiplier: f64) -> u32 {
        if initial >= max || multiplier <= 1.0 {
            return 1;
        }
        let ratio = max.as_secs_f64() / initial.as_secs_f64();
        ratio.log(multiplier).floor() as u32 + 1
    }

    /// Overrides the computed attempt limit with a stricter one.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Rewinds the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt += 1;
        let limit = self.max_attempts.unwrap_or(self.saturation_attempts);
        if self.attempt > limit {
            return Err(BackoffError::MaxAttemptsExceeded(limit));
        }

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);
        Ok(sleep)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// One second initial delay, 60 second cap, 50% growth per attempt.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.5)
    }
}
