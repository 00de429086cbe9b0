//! Token bucket implementation.

use std::time::Instant;

use parking_lot::Mutex;

/// Refill policy shared by every bucket of one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    /// Maximum tokens a bucket can hold
    pub capacity: f64,
    /// Tokens added per elapsed second
    pub refill_rate: f64,
}

/// Result of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumption {
    /// Whether a token was taken
    pub admitted: bool,
    /// Tokens left after the attempt
    pub tokens: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Bring the token count up to date with `now`.
    fn refill(&mut self, policy: BucketPolicy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * policy.refill_rate).min(policy.capacity);
            self.last_refill = now;
        }
    }
}

/// A single client's token bucket.
///
/// Refill is lazy: the bucket is brought up to date whenever it is touched,
/// in proportion to the time since it was last touched. All state sits
/// behind the bucket's own lock, independent of any other bucket.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn full(policy: BucketPolicy, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: policy.capacity,
                last_refill: now,
            }),
        }
    }

    /// Refill, then take one token if a whole one is available.
    pub fn try_consume(&self, policy: BucketPolicy, now: Instant) -> Consumption {
        let mut state = self.state.lock();
        state.refill(policy, now);

        let admitted = state.tokens >= 1.0;
        if admitted {
            state.tokens -= 1.0;
        }

        Consumption {
            admitted,
            tokens: state.tokens,
        }
    }

    /// The token count as of `now`, without recording the refill.
    pub fn tokens_at(&self, policy: BucketPolicy, now: Instant) -> f64 {
        let state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * policy.refill_rate).min(policy.capacity)
    }

    /// Whether the bucket would be back at full capacity by `now`.
    pub fn is_saturated(&self, policy: BucketPolicy, now: Instant) -> bool {
        self.tokens_at(policy, now) >= policy.capacity
    }
}
