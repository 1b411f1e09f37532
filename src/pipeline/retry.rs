use std::time::Duration;

/// Doubling retry delay, capped at `max_delay_ms`
///
/// There is no attempt limit; the persistence worker relies on shutdown to
/// stop retrying.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: initial_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(initial_delay_ms.max(1)),
            current_attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before the next attempt, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u64.checked_pow(self.current_attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        self.current_attempt = self.current_attempt.saturating_add(1);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
