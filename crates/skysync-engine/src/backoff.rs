//! Retry timer for blocked rows.
//!
//! A blocked row (open failure, rename failure) is revisited only once its
//! timer arms; every further failure doubles the wait up to a cap, so a
//! permanently wedged file costs one attempt every few minutes instead of
//! one per pass.

use std::time::{Duration, Instant};

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Exponential backoff timer.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    deadline: Instant,
    current: Duration,
}

impl BackoffTimer {
    /// Starts a timer at the initial delay.
    pub fn new() -> Self {
        Self::with_initial(INITIAL_DELAY)
    }

    /// Starts a timer at a caller-chosen initial delay (tests use zero).
    pub fn with_initial(delay: Duration) -> Self {
        Self {
            deadline: Instant::now() + delay,
            current: delay,
        }
    }

    /// True once the wait has elapsed and the operation may be retried.
    pub fn armed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time remaining until the timer arms.
    pub fn retry_in(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Doubles the delay (capped) and re-arms the timer; called when the
    /// operation fails again.
    pub fn bump(&mut self) {
        self.current = (self.current * 2).max(INITIAL_DELAY).min(MAX_DELAY);
        self.deadline = Instant::now() + self.current;
    }
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new()
    }
}
