use std::thread;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{BrokerError, EngineError};

/// Bounded retry with a fixed delay for broker calls
///
/// Only `BrokerError::Unavailable` is retried. Rejections and unknown tickets
/// are returned on the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.attempts, config.delay())
    }

    /// Run `call` until it succeeds, fails permanently, or the budget is spent
    pub fn run<T>(
        &self,
        operation: &str,
        mut call: impl FnMut() -> Result<T, BrokerError>,
    ) -> Result<T, EngineError> {
        let mut attempt = 1;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation,
                        attempt,
                        self.attempts,
                        err,
                        self.delay
                    );
                    attempt += 1;
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
                Err(err) => return Err(EngineError::from_broker(operation, err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = policy().run("server_time", || {
            calls += 1;
            if calls < 3 {
                Err(BrokerError::Unavailable("timeout".into()))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), _> = policy().run("recent_bars", || {
            calls += 1;
            Err(BrokerError::Unavailable("timeout".into()))
        });

        assert!(matches!(
            result,
            Err(EngineError::ConnectivityFailure { .. })
        ));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_rejection_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = policy().run("submit_market", || {
            calls += 1;
            Err(BrokerError::Rejected {
                code: 10006,
                message: "rejected".into(),
            })
        });

        assert!(matches!(result, Err(EngineError::OrderRejected(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_still_calls_once() {
        let mut calls = 0;
        let _ = RetryPolicy::new(0, Duration::ZERO).run("x", || {
            calls += 1;
            Ok::<_, BrokerError>(())
        });
        assert_eq!(calls, 1);
    }
}
