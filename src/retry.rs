//! Bounded retry with a fixed inter-attempt delay.
//!
//! The same policy type wraps a whole sync cycle and each per-sink publish. Every
//! attempt gets its own deadline, which the operation passes down to its I/O
//! (HTTP agent timeout, database statement timeout, broker acknowledgement wait).

use log::{debug, warn};
use std::fmt::Display;
use std::num::NonZeroU32;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: NonZeroU32,
    pub delay: Duration,
    /// Time budget of a single attempt.
    pub timeout: Duration,
}

/// Handed to each invocation of the retried operation.
#[derive(Debug, Copy, Clone)]
pub struct Attempt {
    pub number: u32,
    pub deadline: Instant,
}

impl Attempt {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

impl RetryPolicy {
    pub fn new(attempts: NonZeroU32, delay: Duration, timeout: Duration) -> Self {
        RetryPolicy {
            attempts,
            delay,
            timeout,
        }
    }

    /// A single attempt, no delay.
    pub fn once(timeout: Duration) -> Self {
        RetryPolicy::new(NonZeroU32::MIN, Duration::ZERO, timeout)
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the last error.
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(Attempt) -> Result<T, E>,
    {
        let total = self.attempts.get();
        let mut number = 1;
        loop {
            let attempt = Attempt {
                number,
                deadline: Instant::now() + self.timeout,
            };
            match op(attempt) {
                Ok(value) => {
                    if number > 1 {
                        debug!("{}: succeeded on attempt {}/{}", label, number, total);
                    }
                    return Ok(value);
                }
                Err(e) if number < total => {
                    warn!(
                        "{}: attempt {}/{} failed: {}; retrying in {}s",
                        label,
                        number,
                        total,
                        e,
                        self.delay.as_secs_f64()
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    number += 1;
                }
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}; giving up", label, number, total, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(NonZeroU32::new(attempts).unwrap(), Duration::ZERO, Duration::from_secs(5))
    }

    #[test]
    fn stops_at_first_success() {
        let mut calls = 0;
        let result: Result<u32, String> = policy(3).run("test", |attempt| {
            calls += 1;
            if attempt.number < 2 {
                Err(format!("boom {}", attempt.number))
            } else {
                Ok(attempt.number)
            }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);
    }

    #[test]
    fn returns_last_error_after_exhausting_attempts() {
        let mut seen = Vec::new();
        let result: Result<(), String> = policy(3).run("test", |attempt| {
            seen.push(attempt.number);
            Err(format!("failure {}", attempt.number))
        });
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let mut calls = 0;
        let result: Result<(), &str> = RetryPolicy::once(Duration::from_secs(1)).run("test", |_| {
            calls += 1;
            Err("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn each_attempt_gets_a_fresh_deadline() {
        let p = policy(2);
        let mut deadlines = Vec::new();
        let _: Result<(), &str> = p.run("test", |attempt| {
            assert!(!attempt.expired());
            assert!(attempt.remaining() <= p.timeout);
            deadlines.push(attempt.deadline);
            Err("again")
        });
        assert_eq!(deadlines.len(), 2);
        assert!(deadlines[1] >= deadlines[0]);
    }

    #[test]
    fn zero_budget_attempt_is_expired() {
        let now = Instant::now();
        assert!(Attempt { number: 1, deadline: now }.expired());
        let later = Attempt {
            number: 1,
            deadline: now + Duration::from_secs(60),
        };
        assert!(!later.expired());
    }
}
