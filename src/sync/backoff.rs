use rand::Rng;
use std::time::Duration;

/// Relative jitter applied around the exponential delay.
pub const JITTER_RATIO: f64 = 0.1;

/// Delay before retry number `retry_count`.
///
/// `min(base * 2^retry_count * (1 + 0.1 * jitter), max)` with `jitter` in
/// `[-1, 1]`. Values outside that range are clamped.
pub fn backoff_delay(retry_count: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
  let exponential = base.as_secs_f64() * 2f64.powi(retry_count.min(32) as i32);
  let jittered = exponential * (1.0 + JITTER_RATIO * jitter.clamp(-1.0, 1.0));
  Duration::from_secs_f64(jittered.max(0.0)).min(max)
}

/// [`backoff_delay`] with a random jitter.
pub fn jittered_backoff(retry_count: u32, base: Duration, max: Duration) -> Duration {
  let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
  backoff_delay(retry_count, base, max, jitter)
}
