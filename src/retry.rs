use std::thread;
use std::time::Duration;

use tracing::warn;

/// Bounded retry with linear backoff.
///
/// `max_attempts` counts every call, so a policy of 3 runs the operation at
/// most three times. The predicate decides whether a failure is worth
/// another attempt; anything it rejects is returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Three attempts, used for outbound HTTP.
    pub const fn http() -> Self {
        Self::new(3, Duration::from_millis(200))
    }

    /// Twenty attempts, used for store connectivity.
    pub const fn store() -> Self {
        Self::new(20, Duration::from_millis(100))
    }

    pub fn without_delay(self) -> Self {
        Self {
            delay: Duration::ZERO,
            ..self
        }
    }

    pub fn run<T, E, F, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1usize;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && is_retryable(&err) => {
                    warn!(attempt, max_attempts, error = %err, "retrying operation");
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay * attempt as u32);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn stops_after_max_attempts() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::http().without_delay();
        let result: Result<(), String> = policy.run(
            || {
                calls.set(calls.get() + 1);
                Err("boom".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retryable_fails_immediately() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::store().without_delay();
        let result: Result<(), String> = policy.run(
            || {
                calls.set(calls.get() + 1);
                Err("fatal".to_string())
            },
            |_| false,
        );
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::store().without_delay();
        let result: Result<u32, String> = policy.run(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 5 {
                    Err("busy".to_string())
                } else {
                    Ok(42)
                }
            },
            |err| err == "busy",
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 5);
    }
}
