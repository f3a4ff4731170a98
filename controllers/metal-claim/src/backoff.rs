//! # Fibonacci Backoff
//!
//! Requeue delays for machines waiting on a host. The delay grows more
//! slowly than exponential backoff so a machine notices freed hosts within
//! a few minutes without hammering the API server while the pool is empty.
//!
//! Sequence for a 30s minimum and 5m maximum: 30s, 30s, 60s, 90s, 150s,
//! 240s, 300s (max).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff (for reset)
    min: Duration,
    /// Previous backoff value
    prev: Duration,
    /// Current backoff value
    current: Duration,
    /// Maximum backoff value
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given bounds
    ///
    /// # Arguments
    ///
    /// * `min` - Used for the first two values
    /// * `max` - Caps the sequence
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// Per-resource backoff state keyed by `namespace/name`
#[derive(Debug)]
pub struct RequeueBackoff {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl RequeueBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Next delay for `key`, advancing its sequence
    pub fn next(&self, key: &str) -> Duration {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min, self.max))
            .next_backoff()
    }

    /// Forget `key` (on success or deletion)
    pub fn reset(&self, key: &str) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(30), Duration::from_secs(300));
        let seen: Vec<Duration> = (0..9).map(|_| backoff.next_backoff()).collect();

        // Capped at 300s once 390s would be next
        assert_eq!(seen, secs(&[30, 30, 60, 90, 150, 240, 300, 300, 300]));
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(30), Duration::from_secs(300));
        for _ in 0..4 {
            backoff.next_backoff();
        }

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn test_requeue_backoff_is_per_resource() {
        let backoff = RequeueBackoff::new(Duration::from_secs(10), Duration::from_secs(60));
        backoff.next("default/a");
        backoff.next("default/a");
        assert_eq!(backoff.next("default/a"), Duration::from_secs(20));
        assert_eq!(backoff.next("default/b"), Duration::from_secs(10));

        backoff.reset("default/a");
        assert_eq!(backoff.next("default/a"), Duration::from_secs(10));
    }
}
