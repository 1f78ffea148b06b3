//! Reconnect delay policy
//!
//! Delays double after every failed attempt, capped at [`MAX_DELAY`].
//! Only a successful open resets them to [`INITIAL_DELAY`].

use std::time::Duration;

/// Delay before the first reconnect attempt
pub const INITIAL_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound on any reconnect delay
pub const MAX_DELAY: Duration = Duration::from_millis(16000);

/// Next delay after `previous`: `min(previous * 2, MAX_DELAY)`
pub fn next_delay(previous: Duration) -> Duration {
    previous.saturating_mul(2).min(MAX_DELAY)
}

/// Current reconnect delay for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
        }
    }

    /// Delay to wait before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Move to the next delay and return it
    pub fn advance(&mut self) -> Duration {
        self.current = next_delay(self.current);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_doubles_until_cap() {
        assert_eq!(next_delay(Duration::from_millis(1000)), Duration::from_millis(2000));
        assert_eq!(next_delay(Duration::from_millis(8000)), Duration::from_millis(16000));
        assert_eq!(next_delay(Duration::from_millis(16000)), MAX_DELAY);
        assert_eq!(next_delay(Duration::from_millis(12000)), MAX_DELAY);
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new();
        let mut seen = vec![backoff.current()];
        for _ in 0..6 {
            seen.push(backoff.advance());
        }

        let expected: Vec<Duration> = (0..7u32)
            .map(|k| Duration::from_millis((1000u64 << k).min(16000)))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(4000));

        backoff.reset();
        assert_eq!(backoff.current(), INITIAL_DELAY);
    }

    #[test]
    fn test_huge_delay_saturates() {
        assert_eq!(next_delay(Duration::MAX), MAX_DELAY);
    }
}
