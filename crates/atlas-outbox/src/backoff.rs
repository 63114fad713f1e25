//! Exponential backoff retry scheduler (§4.5 Retry schedule, §8 property 7).
//!
//! Grounded directly on `strata-agent::control::run`'s reconnect loop —
//! `backoff = (backoff * 2).min(max_backoff)` — extended with the
//! multiplicative jitter spec.md requires.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_CAP: Duration = Duration::from_secs(300);

/// `next_attempt = now + base * 2^retry_count * jitter`, jitter in `[0.5, 1.5]`,
/// with the exponential term capped before jitter is applied.
pub fn next_delay(retry_count: u32, base: Duration, cap: Duration, rng: &mut impl Rng) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(retry_count as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jitter = rng.random_range(0.5..=1.5);
    Duration::from_secs_f64(capped * jitter)
}
