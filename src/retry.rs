//! Retry classification and exponential backoff
//!
//! Download attempts that fail with a transient error are retried after a delay of
//! `min(initial_delay * backoff_multiplier^(retry - 1), max_delay)`, optionally jittered.
//! A server-supplied `Retry-After` overrides the computed delay for that one retry.
//!
//! # Example
//!
//! ```
//! use civitai_dl::config::RetryConfig;
//! use civitai_dl::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     jitter: false,
//!     ..Default::default()
//! };
//! assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
//! assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
//! ```

use crate::config::RetryConfig;
use crate::error::FetchError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (client errors, bad URLs, filesystem errors) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Delay requested by the remote side before the next attempt, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            // Request, server and rate-limit timeouts
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            // Anything on the wire except a request that could not even be built
            FetchError::Network(e) => !e.is_builder(),
            FetchError::Stalled { .. } => true,
            FetchError::Truncated { .. } => true,
            FetchError::Filesystem { source, .. } => {
                source.kind() == std::io::ErrorKind::Interrupted
            }
            FetchError::InvalidUrl { .. } => false,
            FetchError::Cancelled => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status {
                status: 429 | 503,
                retry_after,
            } => *retry_after,
            _ => None,
        }
    }
}

/// Base backoff delay before retry number `retry` (1-based), without jitter
///
/// Capped at `config.max_delay`.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let max = config.max_delay.as_secs_f64();

    if !secs.is_finite() || secs >= max {
        config.max_delay
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Delay to wait before retry number `retry` after `error`
///
/// A `Retry-After` hint from the server wins over the computed backoff and is capped at
/// `config.max_delay`. Otherwise the backoff delay is used, jittered if configured.
pub fn next_delay<E: IsRetryable>(config: &RetryConfig, retry: u32, error: &E) -> Duration {
    if let Some(hint) = error.retry_after() {
        return hint.min(config.max_delay);
    }

    let delay = backoff_delay(config, retry);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Parse a `Retry-After` header value
///
/// Accepts delta-seconds (`"120"`) or an HTTP-date (`"Wed, 21 Oct 2015 07:28:00 GMT"`).
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
