//! Retry decisions and backoff delays.
//!
//! Stateless: the retry node owns the attempt loop and asks [`RetryHandler`]
//! whether another attempt is allowed and how long to wait before it.

use std::time::Duration;

use weft_types::error::ErrorKind;
use weft_types::node::{BackoffStrategy, RetryConfig};

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failure of `kind` on 1-based `attempt` earns another attempt.
    ///
    /// Cancellation is never retried, even when listed.
    pub fn should_retry(config: &RetryConfig, attempt: u32, kind: ErrorKind) -> bool {
        if attempt >= config.max_attempts || kind == ErrorKind::Cancelled {
            return false;
        }
        if config.retry_on_errors.is_empty() {
            kind.is_retryable()
        } else {
            config.retry_on_errors.contains(&kind)
        }
    }

    /// Delay before the attempt following 1-based `attempt`, capped at
    /// `max_delay_ms`.
    pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let base = config.initial_delay_ms;
        let ms = match config.backoff_strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt.max(1))),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let scaled = base as f64 * config.multiplier.powi(exponent);
                if scaled.is_finite() && scaled < config.max_delay_ms as f64 {
                    scaled as u64
                } else {
                    config.max_delay_ms
                }
            }
        };
        Duration::from_millis(ms.min(config.max_delay_ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            backoff_strategy: strategy,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            retry_on_errors: Vec::new(),
        }
    }

    #[test]
    fn test_backoff_constant() {
        let cfg = config(BackoffStrategy::Constant);
        assert_eq!(RetryHandler::backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 4), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_linear() {
        let cfg = config(BackoffStrategy::Linear);
        assert_eq!(RetryHandler::backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 3), Duration::from_millis(300));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 50), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_exponential_is_capped() {
        let cfg = config(BackoffStrategy::Exponential);
        assert_eq!(RetryHandler::backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 4), Duration::from_millis(800));
        assert_eq!(RetryHandler::backoff_delay(&cfg, 5), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::backoff_delay(&cfg, u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_should_retry_respects_attempt_limit() {
        let cfg = config(BackoffStrategy::Constant);
        assert!(RetryHandler::should_retry(&cfg, 4, ErrorKind::Http));
        assert!(!RetryHandler::should_retry(&cfg, 5, ErrorKind::Http));
    }

    #[test]
    fn test_should_retry_filters_kinds() {
        let mut cfg = config(BackoffStrategy::Constant);
        assert!(RetryHandler::should_retry(&cfg, 1, ErrorKind::Timeout));
        assert!(!RetryHandler::should_retry(&cfg, 1, ErrorKind::Evaluation));

        cfg.retry_on_errors = vec![ErrorKind::Evaluation];
        assert!(RetryHandler::should_retry(&cfg, 1, ErrorKind::Evaluation));
        assert!(!RetryHandler::should_retry(&cfg, 1, ErrorKind::Http));
        assert!(!RetryHandler::should_retry(&cfg, 1, ErrorKind::Cancelled));
    }
}
