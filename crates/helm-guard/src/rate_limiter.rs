//! Per-action-type token bucket limiter persisted through a [`KeyValueStore`].
//!
//! Buckets are loaded lazily on first use and written back whenever a refill
//! adds tokens or an action consumes one, so limits survive restarts. Store
//! failures are logged and the in-memory bucket stays authoritative.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use helm_core::{Clock, KeyValueStore};
use helm_settings::RateLimitSettings;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bucket::{self, Bucket};

/// Store key prefix for buckets.
pub const KEY_PREFIX: &str = "rate_limit:";

/// Configured capacity for one action type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    /// Tokens per window.
    pub max: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl From<&RateLimitSettings> for Limit {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            max: s.max,
            window_ms: s.window_ms(),
        }
    }
}

/// Snapshot returned by [`RateLimiter::check_limit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// At least one token is available.
    pub allowed: bool,
    /// Whole tokens left; `None` for unconfigured (unlimited) action types.
    pub remaining: Option<u32>,
    /// Time until the next token arrives.
    pub reset_in: Duration,
}

impl RateLimitStatus {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_in: Duration::ZERO,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    limits: HashMap<String, Limit>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Limiter over explicit limits.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        limits: HashMap<String, Limit>,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter over the `rateLimits` settings section.
    pub fn from_settings(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: &BTreeMap<String, RateLimitSettings>,
    ) -> Self {
        let limits = settings
            .iter()
            .map(|(action_type, s)| (action_type.clone(), Limit::from(s)))
            .collect();
        Self::new(store, clock, limits)
    }

    /// Whether `action_type` has a configured limit.
    pub fn is_configured(&self, action_type: &str) -> bool {
        self.limits.contains_key(action_type)
    }

    /// Refill, then report availability without consuming.
    pub async fn check_limit(&self, action_type: &str) -> RateLimitStatus {
        let Some(limit) = self.limits.get(action_type).copied() else {
            return RateLimitStatus::unlimited();
        };
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().await;
        let bucket = self.bucket(&mut buckets, action_type, limit, now).await;
        if bucket::refill(bucket, now) {
            self.persist(bucket).await;
        }
        RateLimitStatus {
            allowed: bucket.tokens >= 1.0,
            remaining: Some(bucket.remaining()),
            reset_in: Duration::from_millis(bucket::reset_in_ms(bucket, now)),
        }
    }

    /// Consume one token. Returns `false`, leaving the bucket untouched, when empty.
    pub async fn record_action(&self, action_type: &str) -> bool {
        let Some(limit) = self.limits.get(action_type).copied() else {
            return true;
        };
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().await;
        let bucket = self.bucket(&mut buckets, action_type, limit, now).await;
        let refilled = bucket::refill(bucket, now);
        let consumed = bucket::try_consume(bucket);
        if consumed || refilled {
            self.persist(bucket).await;
        }
        if consumed {
            debug!(action_type, remaining = bucket.remaining(), "token consumed");
        } else {
            debug!(action_type, "rate limited");
        }
        consumed
    }

    /// Refill the bucket to capacity.
    pub async fn reset(&self, action_type: &str) {
        let Some(limit) = self.limits.get(action_type).copied() else {
            return;
        };
        let now = self.clock.now_ms();
        let fresh = Bucket::full(action_type, limit.max, limit.window_ms, now);
        self.persist(&fresh).await;
        let _ = self
            .buckets
            .lock()
            .await
            .insert(action_type.to_string(), fresh);
    }

    async fn bucket<'a>(
        &self,
        buckets: &'a mut HashMap<String, Bucket>,
        action_type: &str,
        limit: Limit,
        now: i64,
    ) -> &'a mut Bucket {
        if !buckets.contains_key(action_type) {
            let loaded = self.load(action_type, limit, now).await;
            let _ = buckets.insert(action_type.to_string(), loaded);
        }
        buckets
            .entry(action_type.to_string())
            .or_insert_with(|| Bucket::full(action_type, limit.max, limit.window_ms, now))
    }

    async fn load(&self, action_type: &str, limit: Limit, now: i64) -> Bucket {
        let key = format!("{KEY_PREFIX}{action_type}");
        let stored = match self.store.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(action_type, error = %err, "failed to load rate limit bucket");
                None
            }
        };
        match stored.map(serde_json::from_value::<Bucket>) {
            Some(Ok(mut bucket)) => {
                bucket.reconfigure(limit.max, limit.window_ms);
                bucket
            }
            Some(Err(err)) => {
                warn!(action_type, error = %err, "discarding malformed rate limit bucket");
                Bucket::full(action_type, limit.max, limit.window_ms, now)
            }
            None => Bucket::full(action_type, limit.max, limit.window_ms, now),
        }
    }

    async fn persist(&self, bucket: &Bucket) {
        let key = format!("{KEY_PREFIX}{}", bucket.action_type);
        let value = match serde_json::to_value(bucket) {
            Ok(v) => v,
            Err(err) => {
                warn!(key, error = %err, "failed to encode rate limit bucket");
                return;
            }
        };
        if let Err(err) = self.store.set(&key, value).await {
            warn!(key, error = %err, "failed to persist rate limit bucket");
        }
    }
}
