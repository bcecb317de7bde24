use std::time::Duration;

/// Capped exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << self.attempt.min(16);
        self.attempt += 1;
        Some(std::cmp::min(self.initial.saturating_mul(factor), self.max))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
