//! Token bucket arithmetic.
//!
//! Pure functions over [`Bucket`]. Time is passed in explicitly so the
//! limiter above can drive them from an injected clock.

use serde::{Deserialize, Serialize};

/// Persisted state of one action type's bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Action type this bucket throttles.
    pub action_type: String,
    /// Available tokens, `0 <= tokens <= max`.
    pub tokens: f64,
    /// Capacity.
    pub max: u32,
    /// Time for a full refill, in milliseconds.
    pub window_ms: u64,
    /// Unix milliseconds of the last refill that added tokens.
    pub last_refill: i64,
}

impl Bucket {
    /// A full bucket.
    pub fn full(action_type: &str, max: u32, window_ms: u64, now_ms: i64) -> Self {
        Self {
            action_type: action_type.to_string(),
            tokens: f64::from(max),
            max,
            window_ms,
            last_refill: now_ms,
        }
    }

    /// Apply configured limits over persisted ones, clamping tokens.
    pub fn reconfigure(&mut self, max: u32, window_ms: u64) {
        self.max = max;
        self.window_ms = window_ms;
        self.tokens = self.tokens.clamp(0.0, f64::from(max));
    }

    /// Whole tokens available.
    pub fn remaining(&self) -> u32 {
        self.tokens.max(0.0).floor() as u32
    }
}

/// Add `floor(elapsed * max / window)` tokens. Returns whether the bucket changed.
///
/// `last_refill` only advances when at least one token is added, so partial
/// progress toward the next token is never lost.
pub fn refill(bucket: &mut Bucket, now_ms: i64) -> bool {
    if bucket.window_ms == 0 {
        return false;
    }
    let elapsed = now_ms.saturating_sub(bucket.last_refill).max(0) as u128;
    let add = elapsed * u128::from(bucket.max) / u128::from(bucket.window_ms);
    if add == 0 {
        return false;
    }
    let max = f64::from(bucket.max);
    bucket.tokens = (bucket.tokens + add as f64).min(max);
    bucket.last_refill = now_ms;
    true
}

/// Consume one token if available.
pub fn try_consume(bucket: &mut Bucket) -> bool {
    if bucket.tokens >= 1.0 {
        bucket.tokens -= 1.0;
        true
    } else {
        false
    }
}

/// Milliseconds until the next token arrives; zero when the bucket is full.
pub fn reset_in_ms(bucket: &Bucket, now_ms: i64) -> u64 {
    if bucket.tokens >= f64::from(bucket.max) || bucket.max == 0 {
        return 0;
    }
    let per_token = bucket.window_ms.div_ceil(u64::from(bucket.max));
    let elapsed = now_ms.saturating_sub(bucket.last_refill).max(0) as u64;
    per_token.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    #[test]
    fn partial_window_adds_floor() {
        let mut b = Bucket::full("post", 3, MINUTE, 0);
        b.tokens = 0.0;
        assert!(refill(&mut b, 20_000));
        assert!((b.tokens - 1.0).abs() < f64::EPSILON);
        assert_eq!(b.last_refill, 20_000);
    }

    #[test]
    fn sub_token_elapsed_keeps_last_refill() {
        let mut b = Bucket::full("post", 3, MINUTE, 0);
        b.tokens = 0.0;
        assert!(!refill(&mut b, 19_999));
        assert_eq!(b.last_refill, 0);
        assert!(refill(&mut b, 20_000));
    }

    #[test]
    fn never_exceeds_max() {
        let mut b = Bucket::full("post", 3, MINUTE, 0);
        b.tokens = 2.0;
        let _ = refill(&mut b, 10 * MINUTE as i64);
        assert!((b.tokens - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let mut b = Bucket::full("post", 3, MINUTE, 50_000);
        b.tokens = 0.0;
        assert!(!refill(&mut b, 10_000));
        assert!(b.tokens.abs() < f64::EPSILON);
    }

    #[test]
    fn consume_stops_at_zero() {
        let mut b = Bucket::full("post", 2, MINUTE, 0);
        assert!(try_consume(&mut b));
        assert!(try_consume(&mut b));
        assert!(!try_consume(&mut b));
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn reconfigure_clamps_tokens() {
        let mut b = Bucket::full("post", 10, MINUTE, 0);
        b.reconfigure(3, 2 * MINUTE);
        assert_eq!(b.remaining(), 3);
        assert_eq!(b.window_ms, 2 * MINUTE);
    }

    #[test]
    fn reset_in_counts_down_to_next_token() {
        let mut b = Bucket::full("post", 3, MINUTE, 0);
        assert_eq!(reset_in_ms(&b, 0), 0);
        b.tokens = 0.0;
        assert_eq!(reset_in_ms(&b, 5_000), 15_000);
        assert_eq!(reset_in_ms(&b, 25_000), 0);
    }
}
