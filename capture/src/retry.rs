//! Bounded fixed-backoff retries for opening the camera.

use std::fmt::Display;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Call `op` until it succeeds or the attempts are used up, sleeping
    /// `backoff` between failures. Returns the last error on exhaustion.
    pub fn run<T, E: Display>(
        &self,
        what: &str,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", what, attempt, attempts);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < attempts => {
                    error!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempts: {}", what, attempts, e);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts two seconds apart.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result: Result<u32, String> =
            policy.run("open", |n| if n < 3 { Err(format!("busy {n}")) } else { Ok(n) });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_with_last_error() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), String> = policy.run("open", |n| {
            calls += 1;
            Err(format!("attempt {n}"))
        });
        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.attempts, 1);
        let result: Result<&str, &str> = policy.run("open", |_| Ok("ok"));
        assert_eq!(result, Ok("ok"));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(2));
    }
}
