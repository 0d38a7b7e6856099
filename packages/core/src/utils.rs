//! General utilities shared across the application.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exponential backoff with full jitter, capped at `max_ms`.
///
/// `attempt` is 0-based (the delay before the first retry). Used by the
/// vendor reconnect loop and, if the bus adapter ever needs its own retry
/// layer beyond what `redis::aio::ConnectionManager` already provides.
#[must_use]
pub fn backoff_delay(attempt: u32, min_ms: u64, max_ms: u64, jitter: f64) -> Duration {
    let exp = min_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);
    let spread = (exp as f64 * jitter).max(0.0);
    let jittered = rand::thread_rng().gen_range(-spread..=spread);
    let delay_ms = (exp as f64 + jittered).max(0.0) as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_nonzero_and_monotonic_ish() {
        let a = now_millis();
        let b = now_millis();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn backoff_delay_respects_cap() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt, 250, 5_000, 0.2);
            assert!(delay.as_millis() as u64 <= 5_000 + (5_000 / 5));
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempt_on_average() {
        let early = backoff_delay(0, 250, 5_000, 0.0);
        let later = backoff_delay(3, 250, 5_000, 0.0);
        assert!(later >= early);
    }
}
