use std::time::{Duration, SystemTime};

use rand::Rng;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Exponential backoff with full jitter.
///
/// The ceiling doubles with every attempt starting at `min`, is capped at
/// `max`, and the returned delay is drawn uniformly from `[0, ceiling]`.
/// `attempt` is 1-based.
pub fn jittered_backoff(min: Duration, max: Duration, attempt: u32) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = min
        .saturating_mul(1u32 << exponent)
        .clamp(min.min(max), max);
    let ceiling_us = ceiling.as_micros() as u64;
    if ceiling_us == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..=ceiling_us))
}
