use chrono::{DateTime, Utc};
use rand::Rng;

/// Full-jitter exponential backoff: uniform(0, min(max_delay, base * 2^(n-1))).
/// Decorrelates retries across workers hitting the same upstream.
pub fn full_jitter_delay(attempt: u32, base_delay: f64, max_delay: f64) -> f64 {
    let attempt = attempt.max(1);
    let base_delay = base_delay.max(0.0);
    let max_delay = max_delay.max(0.0);

    let cap = max_delay.min(base_delay * 2f64.powi(attempt as i32 - 1));
    if cap <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(0.0..=cap)
}

/// Parses a Retry-After header value: integer/float seconds or an HTTP date.
/// Returns None for absent or unparseable values; negative results clamp to
/// zero (a date in the past means "retry now").
pub fn parse_retry_after_seconds(value: Option<&str>) -> Option<f64> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<f64>() {
        return Some(seconds.max(0.0));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?;
    let until = retry_at.with_timezone(&Utc) - Utc::now();
    Some((until.num_milliseconds() as f64 / 1000.0).max(0.0))
}
