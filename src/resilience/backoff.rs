//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Lower bound of the jitter factor.
pub const MIN_JITTER: f64 = 0.1;

/// Delay before retry following attempt `attempt` (0-based).
///
/// `min(max_timeout, min_timeout * 2^attempt * jitter)` with jitter drawn
/// uniformly from `[0.1, 1.0)`.
pub fn calculate_backoff(attempt: u32, min_timeout: Duration, max_timeout: Option<Duration>) -> Duration {
    let jitter = rand::thread_rng().gen_range(MIN_JITTER..1.0);
    backoff_with_jitter(attempt, min_timeout, max_timeout, jitter)
}

/// Deterministic core of [`calculate_backoff`].
pub fn backoff_with_jitter(
    attempt: u32,
    min_timeout: Duration,
    max_timeout: Option<Duration>,
    jitter: f64,
) -> Duration {
    let exponential = min_timeout.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
    let delay = Duration::try_from_secs_f64(exponential * jitter).unwrap_or(Duration::MAX);
    match max_timeout {
        Some(max) => delay.min(max),
        None => delay,
    }
}
