//! Reconnect delay schedule.

use std::time::Duration;

/// Delay before reconnect `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(max)
}
