//! Core rate limiter implementation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::{BucketPolicy, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::key::{normalize, ClientKey};
use crate::config::RateLimitingConfig;
use crate::error::LimiterError;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Configured bucket capacity
    pub limit: u32,
    /// Whole tokens left in the client's bucket after this decision
    pub remaining: u32,
}

/// Per-client token bucket rate limiter.
///
/// Two lock levels keep unrelated clients from contending with each other:
/// the bucket map has one lock that guards only lookup-or-insert, and each
/// bucket guards its own token arithmetic. This struct is thread-safe and
/// can be shared across tasks behind an `Arc`.
pub struct RateLimiter<C: Clock = SystemClock> {
    /// Maximum tokens per bucket
    capacity: u32,
    /// Tokens added per second
    refill_rate: f64,
    /// Buckets indexed by canonical client key
    buckets: Mutex<BucketMap>,
    clock: C,
}

#[derive(Default)]
struct BucketMap {
    entries: HashMap<ClientKey, Arc<TokenBucket>>,
    /// Latest instant at which every evicted bucket was known to be full
    evicted_through: Option<Instant>,
}

impl RateLimiter<SystemClock> {
    /// Create a new rate limiter backed by the system clock.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, LimiterError> {
        Self::with_clock(capacity, refill_rate, SystemClock)
    }

    /// Create a rate limiter from its configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self, LimiterError> {
        Self::new(config.capacity, config.refill_rate)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a new rate limiter that reads time from `clock`.
    pub fn with_clock(capacity: u32, refill_rate: f64, clock: C) -> Result<Self, LimiterError> {
        validate(capacity, refill_rate)?;

        Ok(Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(BucketMap::default()),
            clock,
        })
    }

    /// Decide whether a request from `key` is admitted.
    ///
    /// Returns `Ok(false)` when the client is out of tokens and
    /// `Err(InvalidKey)` when `key` is not an IP address.
    pub fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        self.check(key).map(|decision| decision.admitted)
    }

    /// Like [`allow`](Self::allow), but also reports the limit and the
    /// tokens left.
    pub fn check(&self, key: &str) -> Result<Decision, LimiterError> {
        let key = normalize(key)?;
        Ok(self.check_key(key))
    }

    /// Decide for an address that is already parsed. Cannot fail.
    pub fn check_ip(&self, addr: IpAddr) -> Decision {
        self.check_key(ClientKey::from(addr))
    }

    fn check_key(&self, key: ClientKey) -> Decision {
        let now = self.clock.now();
        let bucket = self.bucket_for(key, now);
        let consumption = bucket.try_consume(self.policy(), now);

        trace!(
            key = %key,
            admitted = consumption.admitted,
            tokens = consumption.tokens,
            "Checked rate limit"
        );

        if !consumption.admitted {
            debug!(key = %key, "Rate limit exceeded");
        }

        Decision {
            admitted: consumption.admitted,
            limit: self.capacity,
            remaining: consumption.tokens.floor() as u32,
        }
    }

    /// Get or create the bucket for `key`.
    ///
    /// The map lock is released before the caller touches the bucket. A
    /// bucket created with a `now` older than the last eviction horizon is
    /// stamped at the horizon instead: the bucket it may replace was full
    /// then, but not necessarily at `now`.
    fn bucket_for(&self, key: ClientKey, now: Instant) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        let stamp = match buckets.evicted_through {
            Some(horizon) if horizon > now => horizon,
            _ => now,
        };
        buckets
            .entries
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    key = %key,
                    capacity = self.capacity,
                    refill_rate = self.refill_rate,
                    "Creating new token bucket"
                );
                Arc::new(TokenBucket::full(self.policy(), stamp))
            })
            .clone()
    }

    /// Current token count for `key`, if it has a bucket.
    ///
    /// Neither consumes a token nor creates a bucket.
    pub fn tokens(&self, key: &str) -> Result<Option<f64>, LimiterError> {
        let key = normalize(key)?;
        let now = self.clock.now();
        let bucket = self.buckets.lock().entries.get(&key).cloned();
        Ok(bucket.map(|b| b.tokens_at(self.policy(), now)))
    }

    /// Drop buckets that have been back at full capacity for at least
    /// `min_idle` and are not in use.
    ///
    /// A full bucket nobody holds is indistinguishable from the fresh one
    /// that would replace it. Requiring it to have been full since
    /// `now - min_idle` covers callers that read the clock before a sweep
    /// and reach the map after it; callers delayed longer than `min_idle`
    /// get a bucket stamped at that horizon (see `bucket_for`).
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, min_idle: Duration) -> usize {
        let Some(horizon) = self.clock.now().checked_sub(min_idle) else {
            return 0;
        };
        let policy = self.policy();

        let mut buckets = self.buckets.lock();
        let before = buckets.entries.len();
        // strong_count is stable here: new clones only happen under this lock
        buckets.entries.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || !bucket.is_saturated(policy, horizon)
        });
        let evicted = before - buckets.entries.len();

        if evicted > 0 {
            buckets.evicted_through = buckets.evicted_through.max(Some(horizon));
            debug!(evicted, remaining = buckets.entries.len(), "Evicted idle token buckets");
        }
        evicted
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Get the number of tracked clients.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().entries.len()
    }

    fn policy(&self) -> BucketPolicy {
        BucketPolicy {
            capacity: f64::from(self.capacity),
            refill_rate: self.refill_rate,
        }
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

/// Check limiter parameters without building a limiter.
pub fn validate(capacity: u32, refill_rate: f64) -> Result<(), LimiterError> {
    if capacity == 0 {
        return Err(LimiterError::InvalidCapacity(capacity));
    }
    if !refill_rate.is_finite() || refill_rate <= 0.0 {
        return Err(LimiterError::InvalidRate(refill_rate));
    }
    Ok(())
}
