//! # Requeue Backoff
//!
//! Per-machine Fibonacci backoff for retryable provisioning failures.
//! Delays are counted in minutes: 1m, 1m, 2m, 3m, 5m, 8m, then 10m forever.
//! A successful reconcile resets the sequence.

use std::time::Duration;

/// Fibonacci sequence over minutes, capped at `max_minutes`
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
            max_minutes,
        }
    }

    /// Current delay; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_minutes * 60);
        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next_minutes.min(self.max_minutes);
        delay
    }

    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}

/// Consecutive failure tracking for one MaasMachine
#[derive(Debug, Clone)]
pub struct RetryState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, 10),
            error_count: 0,
        }
    }
}

impl RetryState {
    /// Record a failure and return how long to wait before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        self.error_count += 1;
        self.backoff.next_delay()
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_fibonacci_sequence_caps_at_ten_minutes() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let delays: Vec<Duration> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                minutes(1),
                minutes(1),
                minutes(2),
                minutes(3),
                minutes(5),
                minutes(8),
                minutes(10),
                minutes(10),
                minutes(10),
            ]
        );
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), minutes(1));
        assert_eq!(backoff.next_delay(), minutes(1));
        assert_eq!(backoff.next_delay(), minutes(2));
    }

    #[test]
    fn test_retry_state_counts_failures() {
        let mut state = RetryState::default();
        assert_eq!(state.record_failure(), minutes(1));
        assert_eq!(state.record_failure(), minutes(1));
        assert_eq!(state.record_failure(), minutes(2));
        assert_eq!(state.error_count(), 3);

        state.reset();
        assert_eq!(state.error_count(), 0);
        assert_eq!(state.record_failure(), minutes(1));
    }
}
