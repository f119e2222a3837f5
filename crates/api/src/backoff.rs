use std::time::Duration;

pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff for the given 1-based attempt number, capped at an
/// hour so schedules stay bounded.
pub fn exponential(base: Duration, attempt: u32) -> Duration {
	let exponent = attempt.saturating_sub(1).min(20);
	base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}
