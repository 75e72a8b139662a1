use std::time::Duration;

/// Longest pause a worker takes before a receive when downstream is full.
pub const MAX_THROTTLE: Duration = Duration::from_secs(10);

/// Pre-receive pause for a given aggregate downstream depth. Zero below 90% of
/// `limit`, rising linearly to `cap` at the limit. A zero limit disables throttling.
pub fn throttle_delay(depth: u64, limit: u64, cap: Duration) -> Duration {
    if limit == 0 {
        return Duration::ZERO;
    }
    let start = (limit as u128 * 9 / 10) as u64;
    if depth <= start {
        return Duration::ZERO;
    }
    let ratio = ((depth - start) as f64 / (limit - start) as f64).min(1.0);
    cap.mul_f64(ratio)
}
